//! 分享编排
//!
//! 一次分享: 以发起方身份连接房间，连接成功后直传字节或发送存储指针。
//! 字节直传失败时提供存储上传回退；指针发送失败即终止。
//!
//! 同一时间只有一次尝试。开始新尝试前先销毁旧传输并递增代数，
//! 旧尝试的任何后续事件都会因代数不匹配而被丢弃。

use bytes::Bytes;
use log::{debug, info, warn};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::state::{ItemKind, ShareInput, ShareState, transition};
use crate::error::ShareError;
use crate::notice::Notice;
use crate::protocol::Envelope;
use crate::storage::{StorageGateway, StoredObjectMeta};
use crate::transfer::{PreparedPayload, TransferSettings, send_payload};
use crate::transport::{PeerConnector, PeerTransport, Role, TransportEvent};

/// 等待对端连接的时限
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// 发送完成到关闭连接之间的等待，让在途数据送达
pub const POINTER_GRACE: Duration = Duration::from_millis(500);

const DEFAULT_MIME: &str = "application/octet-stream";

/// 要分享的内容
#[derive(Debug, Clone, PartialEq)]
pub enum ShareItem {
    /// 本地字节
    Bytes {
        name: String,
        mime_type: String,
        data: Bytes,
    },
    /// 已上传对象的元数据
    Stored(StoredObjectMeta),
}

impl ShareItem {
    pub fn bytes(name: impl Into<String>, mime_type: impl Into<String>, data: Bytes) -> Self {
        ShareItem::Bytes {
            name: name.into(),
            mime_type: mime_type.into(),
            data,
        }
    }

    /// 完整读取文件并猜测 MIME 类型
    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let mime_type = mime_guess::from_path(path)
            .first()
            .map(|m| m.to_string())
            .unwrap_or_else(|| DEFAULT_MIME.to_string());

        Ok(Self::bytes(name, mime_type, Bytes::from(data)))
    }

    pub fn kind(&self) -> ItemKind {
        match self {
            ShareItem::Bytes { .. } => ItemKind::Bytes,
            ShareItem::Stored(_) => ItemKind::Pointer,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ShareItem::Bytes { name, .. } => name,
            ShareItem::Stored(meta) => &meta.filename,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareSettings {
    pub connect_timeout: Duration,
    pub pointer_grace: Duration,
    pub transfer: TransferSettings,
}

impl Default for ShareSettings {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            pointer_grace: POINTER_GRACE,
            transfer: TransferSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    /// 直连传输
    Direct,
    /// 存储上传
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareProgress {
    pub phase: ProgressPhase,
    pub percent: u8,
}

/// 分享进度回调
///
/// 在内部锁内同步调用，实现中不要再调用编排器。
pub trait ShareProgressCallback: Send + Sync {
    /// 状态更新
    fn on_state(&self, state: ShareState);
    /// 进度更新
    fn on_progress(&self, progress: ShareProgress);
    /// 用户可见的提示
    fn on_notice(&self, notice: &Notice);
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShareEvent {
    State(ShareState),
    Progress(ShareProgress),
    Notice(Notice),
}

/// 把回调转发到通道
pub struct ChannelShareCallback {
    tx: mpsc::UnboundedSender<ShareEvent>,
}

impl ChannelShareCallback {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ShareEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ShareProgressCallback for ChannelShareCallback {
    fn on_state(&self, state: ShareState) {
        let _ = self.tx.send(ShareEvent::State(state));
    }

    fn on_progress(&self, progress: ShareProgress) {
        let _ = self.tx.send(ShareEvent::Progress(progress));
    }

    fn on_notice(&self, notice: &Notice) {
        let _ = self.tx.send(ShareEvent::Notice(notice.clone()));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Core {
    state: ShareState,
    generation: u64,
    item: Option<ShareItem>,
    /// 直连时准备好的负载，回退上传复用
    prepared: Option<PreparedPayload>,
    room_id: Option<String>,
    transport: Option<Arc<PeerTransport>>,
    task: Option<JoinHandle<()>>,
}

impl Core {
    fn kind(&self) -> ItemKind {
        self.item.as_ref().map_or(ItemKind::Bytes, ShareItem::kind)
    }
}

/// 在锁内执行转换并通知，返回新状态
fn step(
    core: &mut Core,
    callback: &dyn ShareProgressCallback,
    input: ShareInput,
) -> Result<ShareState, ShareError> {
    let next = transition(core.state, input, core.kind()).ok_or_else(|| {
        ShareError::InvalidState(format!("{:?} is not allowed in {}", input, core.state))
    })?;
    if next != core.state {
        debug!("Share state {} -> {}", core.state, next);
    }
    core.state = next;
    callback.on_state(next);
    Ok(next)
}

pub struct ShareOrchestrator {
    connector: Arc<dyn PeerConnector>,
    gateway: Arc<dyn StorageGateway>,
    settings: ShareSettings,
    callback: Arc<dyn ShareProgressCallback>,
    core: Arc<Mutex<Core>>,
}

impl ShareOrchestrator {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        gateway: Arc<dyn StorageGateway>,
        settings: ShareSettings,
        callback: Arc<dyn ShareProgressCallback>,
    ) -> Self {
        Self {
            connector,
            gateway,
            settings,
            callback,
            core: Arc::new(Mutex::new(Core {
                state: ShareState::Idle,
                generation: 0,
                item: None,
                prepared: None,
                room_id: None,
                transport: None,
                task: None,
            })),
        }
    }

    pub fn state(&self) -> ShareState {
        lock(&self.core).state
    }

    pub fn room_id(&self) -> Option<String> {
        lock(&self.core).room_id.clone()
    }

    /// 选择要分享的内容
    pub fn select_item(&self, item: ShareItem) -> Result<(), ShareError> {
        let mut core = lock(&self.core);
        let kind = item.kind();
        let next = transition(core.state, ShareInput::SelectItem, kind).ok_or_else(|| {
            ShareError::InvalidState(format!("cannot select an item in {}", core.state))
        })?;
        info!("Selected {} for sharing", item.name());
        core.item = Some(item);
        core.prepared = None;
        core.state = next;
        self.callback.on_state(next);
        Ok(())
    }

    /// 输入房间号并开始直连尝试
    pub fn enter_room(&self, room_id: &str) -> Result<(), ShareError> {
        let room_id = room_id.trim();
        if room_id.is_empty() {
            return Err(ShareError::InvalidState("room id is empty".to_string()));
        }

        let mut core = lock(&self.core);
        let item = core
            .item
            .clone()
            .ok_or_else(|| ShareError::InvalidState("no item selected".to_string()))?;
        step(&mut core, self.callback.as_ref(), ShareInput::RoomEntered)?;
        // 每次尝试使用新的代数
        core.generation += 1;

        let (transport, events) =
            PeerTransport::connect(self.connector.clone(), room_id, Role::Initiator);
        let transport = Arc::new(transport);
        let attempt = Attempt {
            core: self.core.clone(),
            callback: self.callback.clone(),
            settings: self.settings,
            transport: transport.clone(),
            generation: core.generation,
        };

        core.room_id = Some(room_id.to_string());
        core.transport = Some(transport);
        core.task = Some(tokio::spawn(attempt.run(item, events)));
        Ok(())
    }

    /// 放弃当前流程后开始新的分享
    pub async fn share(&self, item: ShareItem, room_id: &str) -> Result<(), ShareError> {
        self.teardown().await;
        self.select_item(item)?;
        self.enter_room(room_id)
    }

    /// 确认回退: 把字节上传到存储网关
    ///
    /// 成功或失败都回到 `Idle` 并发出提示。
    pub async fn confirm_fallback(&self) -> Result<StoredObjectMeta, ShareError> {
        let (generation, item, prepared) = {
            let mut core = lock(&self.core);
            step(&mut core, self.callback.as_ref(), ShareInput::ConfirmFallback)?;
            (core.generation, core.item.clone(), core.prepared.clone())
        };

        let result = self.upload(generation, item, prepared).await;

        let mut core = lock(&self.core);
        if core.generation != generation {
            return result;
        }
        let notice = match &result {
            Ok(meta) => {
                info!("Fallback upload stored {}", meta.filename);
                Notice::success(format!("已上传到存储: {}", meta.filename))
            }
            Err(e) => {
                warn!("Fallback upload failed: {}", e);
                Notice::error(format!("上传失败: {}", e))
            }
        };
        self.callback.on_notice(&notice);
        let _ = step(&mut core, self.callback.as_ref(), ShareInput::UploadFinished);
        core.item = None;
        core.prepared = None;
        result
    }

    /// 拒绝回退，回到 `Idle`
    pub fn decline_fallback(&self) -> Result<(), ShareError> {
        let mut core = lock(&self.core);
        step(&mut core, self.callback.as_ref(), ShareInput::DeclineFallback)?;
        core.item = None;
        core.prepared = None;
        Ok(())
    }

    /// 从结束状态回到 `Idle`
    pub fn reset(&self) -> Result<(), ShareError> {
        let mut core = lock(&self.core);
        step(&mut core, self.callback.as_ref(), ShareInput::Reset)?;
        core.item = None;
        core.prepared = None;
        Ok(())
    }

    /// 取消当前流程，回到 `Idle`
    pub async fn cancel(&self) {
        self.teardown().await;
    }

    async fn teardown(&self) {
        let (transport, task) = {
            let mut core = lock(&self.core);
            core.generation += 1;
            if core.state != ShareState::Idle {
                let _ = step(&mut core, self.callback.as_ref(), ShareInput::Abandon);
            }
            core.item = None;
            core.prepared = None;
            core.room_id = None;
            (core.transport.take(), core.task.take())
        };

        if let Some(task) = task {
            task.abort();
        }
        if let Some(transport) = transport {
            transport.destroy().await;
        }
    }

    async fn upload(
        &self,
        generation: u64,
        item: Option<ShareItem>,
        prepared: Option<PreparedPayload>,
    ) -> Result<StoredObjectMeta, ShareError> {
        let payload = match (prepared, item) {
            (Some(payload), _) => payload,
            (None, Some(ShareItem::Bytes { name, mime_type, data })) => {
                prepare(name, mime_type, data).await?
            }
            (None, _) => {
                return Err(ShareError::InvalidState(
                    "no local bytes to upload".to_string(),
                ));
            }
        };

        let core = self.core.clone();
        let callback = self.callback.clone();
        let progress = move |percent: u8| {
            if lock(&core).generation == generation {
                callback.on_progress(ShareProgress {
                    phase: ProgressPhase::Upload,
                    percent,
                });
            }
        };
        Ok(self.gateway.upload(&payload, &progress).await?)
    }
}

impl Drop for ShareOrchestrator {
    fn drop(&mut self) {
        let mut core = lock(&self.core);
        core.generation += 1;
        if let Some(task) = core.task.take() {
            task.abort();
        }
    }
}

async fn prepare(name: String, mime_type: String, data: Bytes) -> Result<PreparedPayload, ShareError> {
    tokio::task::spawn_blocking(move || PreparedPayload::prepare(&name, &mime_type, data))
        .await
        .map_err(|e| ShareError::Compression(e.to_string()))?
        .map_err(ShareError::from)
}

/// 一次直连尝试的任务上下文
struct Attempt {
    core: Arc<Mutex<Core>>,
    callback: Arc<dyn ShareProgressCallback>,
    settings: ShareSettings,
    transport: Arc<PeerTransport>,
    generation: u64,
}

impl Attempt {
    /// 代数匹配时执行转换
    fn advance(&self, input: ShareInput) -> bool {
        let mut core = lock(&self.core);
        if core.generation != self.generation {
            debug!("Dropping {:?} from a superseded attempt", input);
            return false;
        }
        match step(&mut core, self.callback.as_ref(), input) {
            Ok(_) => true,
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    fn notice(&self, notice: Notice) {
        let core = lock(&self.core);
        if core.generation == self.generation {
            self.callback.on_notice(&notice);
        }
    }

    fn progress(&self, percent: u8) {
        let core = lock(&self.core);
        if core.generation == self.generation {
            self.callback.on_progress(ShareProgress {
                phase: ProgressPhase::Direct,
                percent,
            });
        }
    }

    fn keep_prepared(&self, payload: &PreparedPayload) {
        let mut core = lock(&self.core);
        if core.generation == self.generation {
            core.prepared = Some(payload.clone());
        }
    }

    async fn run(self, item: ShareItem, mut events: mpsc::Receiver<TransportEvent>) {
        if let Err(e) = self.wait_connected(&mut events).await {
            self.fail(&item, e).await;
            return;
        }
        if !self.advance(ShareInput::Connected) || !self.advance(ShareInput::BeginAction) {
            return;
        }

        let result = match &item {
            ShareItem::Bytes {
                name,
                mime_type,
                data,
            } => self.send_bytes(name, mime_type, data, &mut events).await,
            ShareItem::Stored(meta) => self.send_pointer(meta).await,
        };

        match result {
            Ok(()) => {
                // 对端有时间收完在途数据后再关闭
                tokio::time::sleep(self.settings.pointer_grace).await;
                self.transport.destroy().await;
                if self.advance(ShareInput::Succeeded) {
                    let message = match &item {
                        ShareItem::Bytes { name, .. } => format!("已发送 {}", name),
                        ShareItem::Stored(meta) => format!("已分享存储文件 {}", meta.filename),
                    };
                    self.notice(Notice::success(message));
                }
            }
            Err(e) => self.fail(&item, e).await,
        }
    }

    async fn wait_connected(
        &self,
        events: &mut mpsc::Receiver<TransportEvent>,
    ) -> Result<(), ShareError> {
        let deadline = tokio::time::sleep(self.settings.connect_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(ShareError::Timeout(format!(
                        "no peer connected within {}s",
                        self.settings.connect_timeout.as_secs()
                    )));
                }
                event = events.recv() => match event {
                    Some(TransportEvent::Connected) => return Ok(()),
                    Some(TransportEvent::Failed(e)) => return Err(e.into()),
                    Some(TransportEvent::Closed) | None => {
                        return Err(ShareError::Connection(
                            "transport closed before connecting".to_string(),
                        ));
                    }
                    Some(TransportEvent::Frame(_)) => {}
                },
            }
        }
    }

    async fn send_bytes(
        &self,
        name: &str,
        mime_type: &str,
        data: &Bytes,
        events: &mut mpsc::Receiver<TransportEvent>,
    ) -> Result<(), ShareError> {
        let payload = prepare(name.to_string(), mime_type.to_string(), data.clone()).await?;
        self.keep_prepared(&payload);

        let transfer = send_payload(
            self.transport.as_ref(),
            &payload,
            self.settings.transfer.chunk_size,
            |percent| self.progress(percent),
        );
        tokio::pin!(transfer);

        tokio::select! {
            result = &mut transfer => result,
            failure = watch_failure(events) => Err(failure),
        }
    }

    async fn send_pointer(&self, meta: &StoredObjectMeta) -> Result<(), ShareError> {
        let frame = Envelope::R2FileShare(meta.clone()).to_frame()?;
        if self.transport.send(frame).await {
            Ok(())
        } else {
            Err(ShareError::Connection(
                "transport refused the storage pointer".to_string(),
            ))
        }
    }

    async fn fail(&self, item: &ShareItem, error: ShareError) {
        self.transport.destroy().await;
        if !self.advance(ShareInput::Failed) {
            return;
        }
        let notice = match item.kind() {
            ItemKind::Bytes => Notice::warn(format!("直连传输失败: {}，可以改用存储上传", error)),
            ItemKind::Pointer => Notice::error(format!("分享失败: {}", error)),
        };
        self.notice(notice);
    }
}

/// 等待传输失败或关闭
async fn watch_failure(events: &mut mpsc::Receiver<TransportEvent>) -> ShareError {
    loop {
        match events.recv().await {
            Some(TransportEvent::Failed(e)) => return e.into(),
            Some(TransportEvent::Closed) | None => {
                return ShareError::Connection("peer closed during transfer".to_string());
            }
            Some(TransportEvent::Connected | TransportEvent::Frame(_)) => {}
        }
    }
}
