//! 分享流程状态机
//!
//! 纯函数 [`transition`] 定义全部合法转换，非法输入返回 `None`。

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareState {
    Idle,
    AwaitingRoomId,
    P2pConnectAttempt,
    P2pConnectedForAction,
    P2pDirectTransfer,
    P2pPointerSend,
    ShareCompleteSuccess,
    P2pDirectTransferFailedOfferR2,
    R2FallbackUpload,
    ShareFailed,
}

impl ShareState {
    pub fn name(&self) -> &'static str {
        match self {
            ShareState::Idle => "idle",
            ShareState::AwaitingRoomId => "awaiting_room_id",
            ShareState::P2pConnectAttempt => "p2p_connect_attempt",
            ShareState::P2pConnectedForAction => "p2p_connected_for_action",
            ShareState::P2pDirectTransfer => "p2p_direct_transfer",
            ShareState::P2pPointerSend => "p2p_pointer_send",
            ShareState::ShareCompleteSuccess => "share_complete_success",
            ShareState::P2pDirectTransferFailedOfferR2 => "p2p_direct_transfer_failed_offer_r2",
            ShareState::R2FallbackUpload => "r2_fallback_upload",
            ShareState::ShareFailed => "share_failed",
        }
    }

    /// 直连尝试进行中（可能触发失败转换）
    pub fn is_attempt_live(&self) -> bool {
        matches!(
            self,
            ShareState::P2pConnectAttempt
                | ShareState::P2pConnectedForAction
                | ShareState::P2pDirectTransfer
                | ShareState::P2pPointerSend
        )
    }
}

impl fmt::Display for ShareState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 分享的内容类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    /// 本地字节，失败后可以回退到存储上传
    Bytes,
    /// 已存储对象的指针，没有进一步的回退
    Pointer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareInput {
    SelectItem,
    RoomEntered,
    Connected,
    BeginAction,
    Succeeded,
    Failed,
    ConfirmFallback,
    DeclineFallback,
    UploadFinished,
    Reset,
    /// 放弃当前流程，任何状态都回到 `Idle`
    Abandon,
}

pub fn transition(state: ShareState, input: ShareInput, kind: ItemKind) -> Option<ShareState> {
    use ShareInput as I;
    use ShareState as S;

    let next = match (state, input) {
        (_, I::Abandon) => S::Idle,
        (S::Idle, I::SelectItem) => S::AwaitingRoomId,
        (S::AwaitingRoomId, I::RoomEntered) => S::P2pConnectAttempt,
        (S::P2pConnectAttempt, I::Connected) => S::P2pConnectedForAction,
        (S::P2pConnectedForAction, I::BeginAction) => match kind {
            ItemKind::Bytes => S::P2pDirectTransfer,
            ItemKind::Pointer => S::P2pPointerSend,
        },
        (S::P2pDirectTransfer | S::P2pPointerSend, I::Succeeded) => S::ShareCompleteSuccess,
        (s, I::Failed) if s.is_attempt_live() => match kind {
            ItemKind::Bytes => S::P2pDirectTransferFailedOfferR2,
            ItemKind::Pointer => S::ShareFailed,
        },
        (S::P2pDirectTransferFailedOfferR2, I::ConfirmFallback) => S::R2FallbackUpload,
        (S::P2pDirectTransferFailedOfferR2, I::DeclineFallback) => S::Idle,
        (S::R2FallbackUpload, I::UploadFinished) => S::Idle,
        (S::ShareCompleteSuccess | S::ShareFailed | S::AwaitingRoomId, I::Reset) => S::Idle,
        _ => return None,
    };
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(kind: ItemKind, inputs: &[ShareInput]) -> Vec<ShareState> {
        let mut state = ShareState::Idle;
        let mut visited = vec![state];
        for input in inputs {
            state = transition(state, *input, kind)
                .unwrap_or_else(|| panic!("{:?} is illegal in {}", input, state));
            visited.push(state);
        }
        visited
    }

    #[test]
    fn test_direct_success_path() {
        use ShareInput::*;
        let states = run(
            ItemKind::Bytes,
            &[SelectItem, RoomEntered, Connected, BeginAction, Succeeded],
        );
        let names: Vec<_> = states.iter().map(ShareState::name).collect();
        assert_eq!(
            names,
            [
                "idle",
                "awaiting_room_id",
                "p2p_connect_attempt",
                "p2p_connected_for_action",
                "p2p_direct_transfer",
                "share_complete_success"
            ]
        );
    }

    #[test]
    fn test_bytes_failure_offers_fallback() {
        use ShareInput::*;
        let states = run(
            ItemKind::Bytes,
            &[SelectItem, RoomEntered, Connected, BeginAction, Failed, ConfirmFallback, UploadFinished],
        );
        assert_eq!(states[5], ShareState::P2pDirectTransferFailedOfferR2);
        assert_eq!(states[6], ShareState::R2FallbackUpload);
        assert_eq!(states[7], ShareState::Idle);

        let declined = run(ItemKind::Bytes, &[SelectItem, RoomEntered, Failed, DeclineFallback]);
        assert_eq!(declined.last(), Some(&ShareState::Idle));
    }

    #[test]
    fn test_pointer_failure_is_terminal() {
        use ShareInput::*;
        for prefix in [
            vec![SelectItem, RoomEntered],
            vec![SelectItem, RoomEntered, Connected],
            vec![SelectItem, RoomEntered, Connected, BeginAction],
        ] {
            let mut inputs = prefix;
            inputs.push(Failed);
            let states = run(ItemKind::Pointer, &inputs);
            assert_eq!(states.last(), Some(&ShareState::ShareFailed));
        }
        assert_eq!(
            transition(ShareState::ShareFailed, ConfirmFallback, ItemKind::Pointer),
            None
        );
    }

    #[test]
    fn test_failure_only_from_live_attempt() {
        for state in [
            ShareState::Idle,
            ShareState::AwaitingRoomId,
            ShareState::ShareCompleteSuccess,
            ShareState::P2pDirectTransferFailedOfferR2,
            ShareState::R2FallbackUpload,
            ShareState::ShareFailed,
        ] {
            assert_eq!(transition(state, ShareInput::Failed, ItemKind::Bytes), None);
        }
    }

    #[test]
    fn test_illegal_inputs_rejected() {
        assert_eq!(
            transition(ShareState::Idle, ShareInput::Connected, ItemKind::Bytes),
            None
        );
        assert_eq!(
            transition(ShareState::P2pConnectAttempt, ShareInput::Succeeded, ItemKind::Bytes),
            None
        );
        assert_eq!(
            transition(ShareState::R2FallbackUpload, ShareInput::Reset, ItemKind::Bytes),
            None
        );
    }

    #[test]
    fn test_abandon_from_anywhere() {
        assert_eq!(
            transition(ShareState::P2pDirectTransfer, ShareInput::Abandon, ItemKind::Bytes),
            Some(ShareState::Idle)
        );
        assert_eq!(
            transition(ShareState::R2FallbackUpload, ShareInput::Abandon, ItemKind::Bytes),
            Some(ShareState::Idle)
        );
    }

    #[test]
    fn test_display_is_snake_case() {
        assert_eq!(
            ShareState::P2pDirectTransferFailedOfferR2.to_string(),
            "p2p_direct_transfer_failed_offer_r2"
        );
        let json = serde_json::to_string(&ShareState::R2FallbackUpload).unwrap();
        assert_eq!(json, "\"r2_fallback_upload\"");
    }
}
