//! 集成测试 - 分享流程
//!
//! 使用内存连接器和内存存储网关，在暂停的时钟下驱动完整的发送和接收流程。

use bytes::Bytes;
use roomdrop_core::share::{CONNECT_TIMEOUT, ShareEvent, ShareState};
use roomdrop_core::transfer::PreparedPayload;
use roomdrop_core::transport::{LinkEvent, PeerConnector, Role};
use roomdrop_core::{
    ChannelShareCallback, MemoryConnector, MemoryGateway, NoticeLevel, ReceiveEvent,
    ReceiverEvent, ShareItem, ShareOrchestrator, ShareReceiver, ShareSettings, StorageGateway,
    TransferSettings,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Harness {
    orchestrator: ShareOrchestrator,
    events: mpsc::UnboundedReceiver<ShareEvent>,
    connector: MemoryConnector,
    gateway: Arc<MemoryGateway>,
}

fn harness() -> Harness {
    let connector = MemoryConnector::new();
    let gateway = Arc::new(MemoryGateway::new());
    let (callback, events) = ChannelShareCallback::new();
    let orchestrator = ShareOrchestrator::new(
        Arc::new(connector.clone()),
        gateway.clone(),
        ShareSettings::default(),
        Arc::new(callback),
    );
    Harness {
        orchestrator,
        events,
        connector,
        gateway,
    }
}

/// 读取事件直到进入 `target`，返回途中经过的状态
async fn wait_for_state(
    events: &mut mpsc::UnboundedReceiver<ShareEvent>,
    target: ShareState,
) -> Vec<ShareState> {
    let mut seen = Vec::new();
    loop {
        match events.recv().await {
            Some(ShareEvent::State(state)) => {
                seen.push(state);
                if state == target {
                    return seen;
                }
            }
            Some(_) => {}
            None => panic!("event stream ended before {target}, saw {seen:?}"),
        }
    }
}

fn drain(events: &mut mpsc::UnboundedReceiver<ShareEvent>) -> Vec<ShareEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn test_direct_transfer_reaches_receiver() {
    let mut h = harness();
    let (receiver, mut received) = ShareReceiver::join(
        Arc::new(h.connector.clone()),
        "room-1",
        TransferSettings::default(),
    );

    let text = "roomdrop ".repeat(20_000);
    h.orchestrator
        .share(
            ShareItem::bytes("notes.txt", "text/plain", Bytes::from(text.clone())),
            "room-1",
        )
        .await
        .unwrap();

    let file = loop {
        match received.recv().await {
            Some(ReceiveEvent::Transfer(ReceiverEvent::Completed(file))) => break file,
            Some(ReceiveEvent::Failed(e)) => panic!("receiver failed: {e}"),
            Some(_) => {}
            None => panic!("receiver stream ended"),
        }
    };
    assert_eq!(file.descriptor.name, "notes.txt");
    assert!(file.descriptor.is_compressed);
    assert_eq!(file.data, Bytes::from(text));

    let states = wait_for_state(&mut h.events, ShareState::ShareCompleteSuccess).await;
    assert_eq!(
        states,
        vec![
            ShareState::AwaitingRoomId,
            ShareState::P2pConnectAttempt,
            ShareState::P2pConnectedForAction,
            ShareState::P2pDirectTransfer,
            ShareState::ShareCompleteSuccess,
        ]
    );
    assert!(drain(&mut h.events).iter().any(|e| matches!(
        e,
        ShareEvent::Notice(n) if n.level == NoticeLevel::Success
    )));
    assert_eq!(h.gateway.upload_count(), 0);

    // 发送方关闭后接收方收到 Closed
    loop {
        match received.recv().await {
            Some(ReceiveEvent::Closed) | None => break,
            Some(_) => {}
        }
    }
    receiver.close().await;

    h.orchestrator.reset().unwrap();
    assert_eq!(h.orchestrator.state(), ShareState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_new_attempt_silences_previous_one() {
    let mut h = harness();
    let item = ShareItem::bytes("a.txt", "text/plain", Bytes::from_static(b"first"));

    h.orchestrator.share(item.clone(), "lonely-1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.connector.live_links_in("lonely-1"), 1);

    h.orchestrator.share(item, "lonely-2").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.connector.live_links_in("lonely-1"), 0);
    assert_eq!(h.connector.live_links(), 1);

    tokio::time::sleep(CONNECT_TIMEOUT * 2).await;
    let failures = drain(&mut h.events)
        .into_iter()
        .filter(|e| *e == ShareEvent::State(ShareState::P2pDirectTransferFailedOfferR2))
        .count();
    assert_eq!(failures, 1);
    assert_eq!(h.orchestrator.room_id().as_deref(), Some("lonely-2"));
    assert_eq!(h.connector.live_links(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_mid_stream_failure_falls_back_to_storage() {
    let mut h = harness();

    // 不读取的小缓冲对端，发送方很快阻塞在数据块上
    let (peer_tx, _peer_rx) = mpsc::channel::<LinkEvent>(4);
    let _peer = h
        .connector
        .dial("room-2", Role::Responder, peer_tx)
        .await
        .unwrap();

    let data = Bytes::from(vec![7u8; 16 * 1024 * 1024]);
    h.orchestrator
        .share(
            ShareItem::bytes("archive.zip", "application/zip", data.clone()),
            "room-2",
        )
        .await
        .unwrap();

    wait_for_state(&mut h.events, ShareState::P2pDirectTransfer).await;
    loop {
        match h.events.recv().await {
            Some(ShareEvent::Progress(_)) => break,
            Some(_) => {}
            None => panic!("event stream ended"),
        }
    }
    assert_eq!(h.connector.sever("room-2"), 2);

    wait_for_state(&mut h.events, ShareState::P2pDirectTransferFailedOfferR2).await;
    assert_eq!(h.connector.live_links(), 0);
    assert!(drain(&mut h.events).iter().any(|e| matches!(
        e,
        ShareEvent::Notice(n) if n.level == NoticeLevel::Warn
    )));

    let meta = h.orchestrator.confirm_fallback().await.unwrap();
    assert_eq!(h.gateway.upload_count(), 1);
    assert_eq!(h.gateway.object_count(), 1);
    assert_eq!(h.orchestrator.state(), ShareState::Idle);
    assert!(meta.filename.ends_with("-archive.zip"));
    assert!(!meta.is_compressed);
    assert_eq!(h.gateway.download(&meta).await.unwrap(), data);

    let events = drain(&mut h.events);
    assert!(events.contains(&ShareEvent::State(ShareState::R2FallbackUpload)));
    assert!(events.iter().any(|e| matches!(
        e,
        ShareEvent::Notice(n) if n.level == NoticeLevel::Success
    )));
    assert_eq!(events.last(), Some(&ShareEvent::State(ShareState::Idle)));
}

#[tokio::test(start_paused = true)]
async fn test_failed_upload_still_returns_idle() {
    let mut h = harness();
    h.gateway.fail_uploads(true);
    h.orchestrator
        .share(
            ShareItem::bytes("a.bin", "application/octet-stream", Bytes::from_static(b"abc")),
            "nobody",
        )
        .await
        .unwrap();
    wait_for_state(&mut h.events, ShareState::P2pDirectTransferFailedOfferR2).await;

    assert!(h.orchestrator.confirm_fallback().await.is_err());
    assert_eq!(h.orchestrator.state(), ShareState::Idle);
    assert_eq!(h.gateway.upload_count(), 0);
    assert_eq!(h.gateway.object_count(), 0);
    assert!(drain(&mut h.events).iter().any(|e| matches!(
        e,
        ShareEvent::Notice(n) if n.level == NoticeLevel::Error
    )));
}

async fn stored_object(gateway: &MemoryGateway) -> roomdrop_core::StoredObjectMeta {
    let payload =
        PreparedPayload::prepare("report.pdf", "application/pdf", Bytes::from_static(b"%PDF"))
            .unwrap();
    gateway.upload(&payload, &|_: u8| {}).await.unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_pointer_share_without_peer_is_terminal() {
    let mut h = harness();
    let meta = stored_object(&h.gateway).await;
    let uploads = h.gateway.upload_count();

    h.orchestrator
        .share(ShareItem::Stored(meta), "empty")
        .await
        .unwrap();

    let states = wait_for_state(&mut h.events, ShareState::ShareFailed).await;
    assert_eq!(states.last(), Some(&ShareState::ShareFailed));
    assert!(drain(&mut h.events).iter().any(|e| matches!(
        e,
        ShareEvent::Notice(n) if n.level == NoticeLevel::Error
    )));
    assert_eq!(h.gateway.upload_count(), uploads);
    assert!(h.orchestrator.confirm_fallback().await.is_err());

    h.orchestrator.reset().unwrap();
    assert_eq!(h.orchestrator.state(), ShareState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_pointer_share_reaches_receiver() {
    let mut h = harness();
    let meta = stored_object(&h.gateway).await;

    let (receiver, mut received) = ShareReceiver::join(
        Arc::new(h.connector.clone()),
        "room-3",
        TransferSettings::default(),
    );
    h.orchestrator
        .share(ShareItem::Stored(meta.clone()), "room-3")
        .await
        .unwrap();

    let pointer = loop {
        match received.recv().await {
            Some(ReceiveEvent::Pointer(pointer)) => break pointer,
            Some(ReceiveEvent::Connected) => {}
            other => panic!("unexpected {other:?}"),
        }
    };
    assert_eq!(pointer, meta);
    assert_eq!(
        h.gateway.download(&pointer).await.unwrap(),
        Bytes::from_static(b"%PDF")
    );

    let states = wait_for_state(&mut h.events, ShareState::ShareCompleteSuccess).await;
    assert!(states.contains(&ShareState::P2pPointerSend));
    receiver.close().await;
}
