//! 压缩策略与 DEFLATE 编解码
//!
//! 策略只看文件名和 MIME 类型，不检查内容。

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{Read, Write};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompressionError {
    #[error("deflate encode failed: {0}")]
    Encode(String),
    #[error("deflate decode failed: {0}")]
    Decode(String),
}

/// 已压缩格式，再压缩没有收益
const INCOMPRESSIBLE_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/avif",
    "image/heic",
    "video/mp4",
    "video/webm",
    "video/quicktime",
    "video/x-matroska",
    "video/x-msvideo",
    "audio/mpeg",
    "application/zip",
    "application/gzip",
    "application/x-gzip",
    "application/x-rar-compressed",
    "application/vnd.rar",
    "application/x-7z-compressed",
    "application/pdf",
];

const INCOMPRESSIBLE_EXTENSIONS: &[&str] = &[".gz", ".zip", ".rar"];

/// 判断是否应在发送前压缩
pub fn should_compress(name: &str, mime_type: &str) -> bool {
    let mime = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if INCOMPRESSIBLE_MIME_TYPES.contains(&mime.as_str()) {
        return false;
    }

    let name = name.to_ascii_lowercase();
    !INCOMPRESSIBLE_EXTENSIONS
        .iter()
        .any(|ext| name.ends_with(ext))
}

pub fn compress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| CompressionError::Encode(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CompressionError::Encode(e.to_string()))
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CompressionError::Decode(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_skips_known_media_types() {
        assert!(!should_compress("holiday.jpg", "image/jpeg"));
        assert!(!should_compress("clip", "video/mp4"));
        assert!(!should_compress("report", "application/pdf"));
        assert!(!should_compress("x", "IMAGE/PNG; charset=binary"));
    }

    #[test]
    fn test_policy_skips_archive_extensions() {
        assert!(!should_compress("logs.tar.gz", "application/octet-stream"));
        assert!(!should_compress("BUNDLE.ZIP", "application/octet-stream"));
        assert!(!should_compress("old.rar", ""));
    }

    #[test]
    fn test_policy_compresses_everything_else() {
        assert!(should_compress("notes.txt", "text/plain"));
        assert!(should_compress("data.json", "application/json"));
        assert!(should_compress("blob", "application/octet-stream"));
        // 启发式只看扩展名结尾
        assert!(should_compress("zipper.txt", "text/plain"));
    }

    #[test]
    fn test_repeated_roundtrip_preserves_bytes() {
        let inputs: Vec<Vec<u8>> = vec![
            Vec::new(),
            b"a".to_vec(),
            b"hello hello hello hello".repeat(100),
            (0..=255u8).cycle().take(70_000).collect(),
        ];

        for original in inputs {
            let mut data = original.clone();
            for _ in 0..3 {
                let packed = compress(&data).unwrap();
                data = decompress(&packed).unwrap();
            }
            assert_eq!(data, original);
        }
    }

    #[test]
    fn test_compression_shrinks_text() {
        let text = b"the quick brown fox ".repeat(1000);
        assert!(compress(&text).unwrap().len() < text.len() / 10);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            decompress(b"definitely not zlib"),
            Err(CompressionError::Decode(_))
        ));
    }
}
