//! End-to-end conversations against an in-memory model

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use talkbridge::config::Config;
use talkbridge::credits::{CreditLedger, InMemoryLedger};
use talkbridge::realtime::{InboundEvent, LoopbackConnector, OutboundEvent, Phase, RemoteEnd};
use talkbridge::session::{EndReason, Notification, RecordingPlayback, Session, SessionManager, SessionOptions, ToolStatus};
use talkbridge::tools::{ToolOutput, ToolRegistry, ToolSpec};
use talkbridge::voice::CaptureMode;
use tokio::sync::{broadcast, mpsc};

const WAIT: Duration = Duration::from_secs(5);

fn manager(tools: ToolRegistry, ledger: Arc<InMemoryLedger>) -> (SessionManager, mpsc::UnboundedReceiver<RemoteEnd>) {
    let mut config = Config::default();
    config.session.reconnect_backoff_ms = 10;
    let (connector, remotes) = LoopbackConnector::new();
    let manager = SessionManager::new(Arc::new(config), connector, Arc::new(tools), ledger as Arc<dyn CreditLedger>);
    (manager, remotes)
}

async fn connect(remotes: &mut mpsc::UnboundedReceiver<RemoteEnd>, session: &Session) -> RemoteEnd {
    let mut remote = tokio::time::timeout(WAIT, remotes.recv()).await.unwrap().unwrap();
    remote.emit(InboundEvent::SessionCreated).await;
    assert!(matches!(remote.next_sent_within(WAIT).await, Some(OutboundEvent::SessionUpdate { .. })));
    let mut phase = session.watch_phase();
    tokio::time::timeout(WAIT, phase.wait_for(|p| *p == Phase::Listening)).await.unwrap().unwrap();
    remote
}

async fn call(remote: &RemoteEnd, name: &str, call_id: &str) {
    remote
        .emit(InboundEvent::FunctionCall {
            name: name.into(),
            arguments: json!({"prompt": "a lighthouse at dusk"}),
            call_id: call_id.into(),
        })
        .await;
}

/// Next function result the session sent, skipping audio
async fn next_result(remote: &mut RemoteEnd) -> (String, serde_json::Value) {
    loop {
        match remote.next_sent_within(WAIT).await {
            Some(OutboundEvent::FunctionCallResult { call_id, output }) => return (call_id, output),
            Some(_) => continue,
            None => panic!("no function result within {:?}", WAIT),
        }
    }
}

async fn wait_for(rx: &mut broadcast::Receiver<Notification>, pred: impl Fn(&Notification) -> bool) -> Notification {
    tokio::time::timeout(WAIT, async {
        loop {
            let n = rx.recv().await.unwrap();
            if pred(&n) {
                return n;
            }
        }
    })
    .await
    .unwrap()
}

fn paid_image_tool(cost: u64, invocations: Arc<std::sync::atomic::AtomicUsize>) -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register_fn(ToolSpec::new("generate_image", "Generate an image").with_cost(cost), move |args| {
        let invocations = invocations.clone();
        async move {
            invocations.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(ToolOutput::ok(json!({
                "media": {"url": "https://cdn.test/lighthouse.png", "prompt": args["prompt"]}
            })))
        }
    });
    tools
}

#[tokio::test]
async fn test_spoken_turn_with_tool_call() {
    let invocations = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let ledger = Arc::new(InMemoryLedger::new(20));
    let (manager, mut remotes) = manager(paid_image_tool(5, invocations.clone()), ledger.clone());
    let playback = RecordingPlayback::new();
    let session = manager
        .start(SessionOptions::new("studio", "alice").with_mode(CaptureMode::Stream).with_playback(playback.clone()))
        .await.unwrap();
    let mut rx = session.subscribe();
    let mut remote = connect(&mut remotes, &session).await;

    session.push_samples(&vec![1200; 24_000]);
    assert!(matches!(remote.next_sent_within(WAIT).await, Some(OutboundEvent::InputAudioAppend { .. })));
    remote.emit(InboundEvent::SpeechStopped).await;
    remote.emit(InboundEvent::UserTranscript { text: "Draw me a lighthouse".into() }).await;
    call(&remote, "generate_image", "call-1").await;

    let (call_id, output) = next_result(&mut remote).await;
    assert_eq!(call_id, "call-1");
    assert_eq!(output["success"], true);
    loop {
        match remote.next_sent_within(WAIT).await {
            Some(OutboundEvent::ResponseCreate) => break,
            Some(OutboundEvent::InputAudioAppend { .. }) => continue,
            other => panic!("expected response.create, got {:?}", other),
        }
    }

    wait_for(&mut rx, |n| matches!(n, Notification::ToolUpdate { status: ToolStatus::Done, credits_charged: 5, .. })).await;
    assert_eq!(ledger.balance("alice").await.unwrap(), 15);
    assert_eq!(invocations.load(std::sync::atomic::Ordering::SeqCst), 1);

    remote.emit(InboundEvent::ResponseCreated).await;
    remote.emit(InboundEvent::AssistantTranscript { text: "Here is your lighthouse.".into() }).await;
    remote.emit(InboundEvent::ResponseDone).await;
    let mut phase = session.watch_phase();
    tokio::time::timeout(WAIT, phase.wait_for(|p| *p == Phase::Listening)).await.unwrap().unwrap();

    let media = session.search_media("lighthouse");
    assert_eq!(media.len(), 1);
    assert_eq!(media[0].url, "https://cdn.test/lighthouse.png");

    assert!(manager.end("studio").await);
    assert_eq!(tokio::time::timeout(WAIT, session.wait()).await.unwrap(), EndReason::Stopped);
    assert!(!manager.end("studio").await);
}

#[tokio::test]
async fn test_insufficient_balance_skips_handler() {
    let invocations = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let ledger = Arc::new(InMemoryLedger::new(3));
    let (manager, mut remotes) = manager(paid_image_tool(5, invocations.clone()), ledger.clone());
    let session = manager.start(SessionOptions::new("studio", "bob")).await.unwrap();
    let mut remote = connect(&mut remotes, &session).await;

    call(&remote, "generate_image", "call-1").await;
    let (_, output) = next_result(&mut remote).await;
    assert_eq!(output["success"], false);
    assert!(output["message"].as_str().unwrap().contains("Insufficient balance"));

    assert_eq!(invocations.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(ledger.balance("bob").await.unwrap(), 3);
    session.shutdown(EndReason::Stopped);
}

#[tokio::test]
async fn test_one_result_per_call_id() {
    let invocations = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let ledger = Arc::new(InMemoryLedger::new(100));
    let (manager, mut remotes) = manager(paid_image_tool(1, invocations.clone()), ledger);
    let session = manager.start(SessionOptions::new("studio", "carol")).await.unwrap();
    let mut remote = connect(&mut remotes, &session).await;

    call(&remote, "generate_image", "a").await;
    call(&remote, "generate_image", "b").await;
    call(&remote, "missing_tool", "c").await;

    let mut sent = Vec::new();
    while let Some(event) = remote.next_sent_within(Duration::from_millis(300)).await {
        sent.push(event);
    }
    let mut ids: Vec<String> = sent
        .iter()
        .filter_map(|e| match e {
            OutboundEvent::FunctionCallResult { call_id, .. } => Some(call_id.clone()),
            _ => None,
        })
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "c"]);

    // The follow-up response is requested only after the last result
    let last_result = sent.iter().rposition(|e| matches!(e, OutboundEvent::FunctionCallResult { .. })).unwrap();
    assert_eq!(sent.last(), Some(&OutboundEvent::ResponseCreate));
    assert!(last_result < sent.len() - 1);
    assert_eq!(invocations.load(std::sync::atomic::Ordering::SeqCst), 2);
    session.shutdown(EndReason::Stopped);
}

#[tokio::test]
async fn test_same_owner_sessions_share_balance() {
    let invocations = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let ledger = Arc::new(InMemoryLedger::new(7));
    let (manager, mut remotes) = manager(paid_image_tool(5, invocations.clone()), ledger.clone());

    let kitchen = manager.start(SessionOptions::new("kitchen", "dana")).await.unwrap();
    let mut kitchen_remote = connect(&mut remotes, &kitchen).await;
    let office = manager.start(SessionOptions::new("office", "dana")).await.unwrap();
    let mut office_remote = connect(&mut remotes, &office).await;

    call(&kitchen_remote, "generate_image", "k1").await;
    call(&office_remote, "generate_image", "o1").await;
    let (_, kitchen_out) = next_result(&mut kitchen_remote).await;
    let (_, office_out) = next_result(&mut office_remote).await;

    // Only one of the two fits in the balance
    let succeeded = [&kitchen_out, &office_out].iter().filter(|o| o["success"] == true).count();
    assert_eq!(succeeded, 1);
    assert_eq!(invocations.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(ledger.balance("dana").await.unwrap(), 2);

    assert_eq!(manager.registry().list_for_owner("dana").await.len(), 2);
    assert_eq!(manager.end_all().await, 2);
    assert!(manager.registry().is_empty().await);
}

#[tokio::test]
async fn test_rejoining_replaces_live_session() {
    let ledger = Arc::new(InMemoryLedger::new(0));
    let (manager, mut remotes) = manager(ToolRegistry::new(), ledger);

    let first = manager.start(SessionOptions::new("den", "erin")).await.unwrap();
    let first_remote = connect(&mut remotes, &first).await;
    let second = manager.start(SessionOptions::new("den", "erin")).await.unwrap();

    assert_eq!(tokio::time::timeout(WAIT, first.wait()).await.unwrap(), EndReason::Replaced);
    tokio::time::timeout(WAIT, first_remote.closed()).await.unwrap();

    // The replaced runner must not evict its successor on the way out
    let _second_remote = connect(&mut remotes, &second).await;
    let live = manager.registry().get("den").await.unwrap();
    assert_eq!(live.instance(), second.instance());

    assert!(manager.end("den").await);
    assert!(manager.registry().is_empty().await);
}
