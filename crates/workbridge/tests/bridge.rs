//! End-to-end behaviour of two bridges over an in-memory channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use workbridge::ops::{AddEditEvent, Restart, UpdateKernels};
use workbridge::{
    Bridge, BridgeConfig, BridgeError, Channel, Envelope, HandlerRegistry, Operation, Role,
    VersionInfo,
};

enum Echo {}
impl Operation for Echo {
    const NAME: &'static str = "echo";
    type Args = (String,);
    type Output = String;
}

enum Sleep {}
impl Operation for Sleep {
    const NAME: &'static str = "sleep";
    type Args = (u64,);
    type Output = u64;
}

enum Explode {}
impl Operation for Explode {
    const NAME: &'static str = "explode";
    type Args = ();
    type Output = ();
}

enum Fail {}
impl Operation for Fail {
    const NAME: &'static str = "fail";
    type Args = ();
    type Output = ();
}

enum Generate {}
impl Operation for Generate {
    const NAME: &'static str = "generate";
    type Args = (usize,);
    type Output = String;
}

/// Larger than the default 16 MiB frame limit.
const OVERSIZED: usize = 17 * 1024 * 1024;

enum Missing {}
impl Operation for Missing {
    const NAME: &'static str = "missing";
    type Args = ();
    type Output = ();
}

fn worker_registry() -> HandlerRegistry {
    let registry = HandlerRegistry::new();
    registry
        .register::<Echo, _, _>(|(text,)| async move { Ok(text) })
        .unwrap();
    registry
        .register::<Sleep, _, _>(|(ms,)| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ms)
        })
        .unwrap();
    registry
        .register::<Explode, _, _>(|()| async move {
            if true {
                panic!("kernel gateway vanished");
            }
            Ok(())
        })
        .unwrap();
    registry
        .register::<Generate, _, _>(|(len,)| async move { Ok("x".repeat(len)) })
        .unwrap();
    registry
        .register::<Fail, _, _>(|()| async move {
            let err = anyhow::anyhow!("connection refused").context("cannot reach kernel server");
            Err::<(), _>(err)
        })
        .unwrap();
    registry
}

fn connected() -> (Bridge, Bridge) {
    let (left, right) = Channel::pair();
    let worker = Bridge::worker(right, worker_registry());
    let master = Bridge::master(left, HandlerRegistry::new());
    (master, worker)
}

#[tokio::test]
async fn call_returns_handler_value() {
    let (master, _worker) = connected();
    let value = master.call::<Echo>(("hello".to_string(),)).await.unwrap();
    assert_eq!(value, "hello");
    assert!(master.pending_calls().is_empty());
}

#[tokio::test]
async fn ping_reports_peer_version() {
    let (left, right) = Channel::pair();
    let worker_version = VersionInfo::new().with_worker("0.2.9");
    let _worker = Bridge::start(
        Role::Worker,
        right,
        BridgeConfig::new().with_version(worker_version.clone()),
        HandlerRegistry::new(),
    );
    let master = Bridge::master(left, HandlerRegistry::new());

    master.ping().await.unwrap();
    assert_eq!(master.ping_info().await.unwrap(), worker_version);
}

#[tokio::test(start_paused = true)]
async fn ping_against_silent_peer_times_out() {
    let (left, _right) = Channel::pair();
    let master = Bridge::master(left, HandlerRegistry::new());

    let started = tokio::time::Instant::now();
    let result = master.ping().await;
    assert!(matches!(result, Err(BridgeError::Timeout { ref operation, .. }) if operation == "ping"));
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(started.elapsed() < Duration::from_secs(3));
    // The timed-out ping no longer occupies the table.
    assert!(master.pending_calls().is_empty());
}

#[tokio::test]
async fn unknown_handler_fails_without_poisoning_bridge() {
    let (master, _worker) = connected();

    let result = master.call::<Missing>(()).await;
    assert_eq!(
        result,
        Err(BridgeError::UnknownHandler {
            operation: "missing".to_string()
        })
    );
    let value = master.call::<Echo>(("still here".to_string(),)).await.unwrap();
    assert_eq!(value, "still here");
}

#[tokio::test]
async fn handler_error_message_is_preserved() {
    let (master, _worker) = connected();

    match master.call::<Fail>(()).await {
        Err(BridgeError::HandlerThrew {
            operation,
            message,
            causes,
        }) => {
            assert_eq!(operation, "fail");
            assert_eq!(message, "cannot reach kernel server");
            assert_eq!(causes, vec!["connection refused".to_string()]);
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn panicking_handler_is_contained() {
    let (master, _worker) = connected();

    let err = master.call::<Explode>(()).await.unwrap_err();
    assert!(matches!(err, BridgeError::HandlerThrew { .. }));
    assert!(err.remote_message().unwrap().contains("kernel gateway vanished"));
    assert_eq!(master.call::<Echo>(("after".to_string(),)).await.unwrap(), "after");
}

#[tokio::test]
async fn invalid_arguments_are_rejected() {
    let (master, _worker) = connected();

    let result = master.call_raw("echo", vec![json!(42)]).await;
    assert!(matches!(
        result,
        Err(BridgeError::InvalidArguments { ref operation, .. }) if operation == "echo"
    ));
}

#[tokio::test]
async fn responses_may_complete_out_of_order() {
    let (master, _worker) = connected();

    let slow = master.begin::<Sleep>((500,));
    let fast = master.begin::<Sleep>((10,));
    let slow_id = slow.id().unwrap();

    let fast_value = fast.wait().await.unwrap();
    assert_eq!(fast_value, json!(10));
    // The slow call is still outstanding after the fast one settled.
    let pending = master.pending_calls();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, slow_id);

    assert_eq!(slow.wait().await.unwrap(), json!(500));
}

#[tokio::test]
async fn concurrent_calls_each_settle_once() {
    let (master, _worker) = connected();
    let master = Arc::new(master);

    let calls: Vec<_> = (0..50)
        .map(|i| {
            let master = Arc::clone(&master);
            tokio::spawn(async move { master.call::<Echo>((format!("call-{i}"),)).await })
        })
        .collect();
    for (i, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap().unwrap(), format!("call-{i}"));
    }
    assert!(master.pending_calls().is_empty());
}

#[tokio::test]
async fn terminate_rejects_pending_calls() {
    let (master, _worker) = connected();

    let pending = master.begin::<Sleep>((60_000,));
    tokio::task::yield_now().await;
    master.terminate();
    master.terminate();

    assert_eq!(pending.wait().await, Err(BridgeError::Terminated));
    assert!(!master.is_open());
    assert_eq!(
        master.call::<Echo>(("late".to_string(),)).await,
        Err(BridgeError::Unreachable)
    );
}

#[tokio::test]
async fn worker_sees_channel_close_after_master_terminates() {
    let (master, worker) = connected();
    master.ping().await.unwrap();
    master.terminate();

    tokio::time::timeout(Duration::from_secs(1), worker.closed())
        .await
        .expect("worker should observe the closed channel");
    assert!(!worker.is_open());
    assert!(!worker.is_terminated());
}

#[tokio::test]
async fn peer_disconnect_rejects_pending_as_unreachable() {
    let (left, right) = Channel::pair();
    let master = Bridge::master(left, HandlerRegistry::new());

    let pending = master.begin::<Restart>(());
    // Read the call, then hang up without answering.
    let (sink, mut stream) = right.into_parts();
    assert!(matches!(
        stream.next().await,
        Some(Ok(Envelope::Call { ref name, .. })) if name == "restart"
    ));
    drop(sink);
    drop(stream);

    assert_eq!(pending.wait().await, Err(BridgeError::Unreachable));
}

#[tokio::test]
async fn duplicate_and_stray_responses_are_discarded() {
    let (left, right) = Channel::pair();
    let master = Bridge::master(left, HandlerRegistry::new());
    let (mut sink, mut stream) = right.into_parts();

    let pending = master.begin::<Echo>(("once".to_string(),));
    let Some(Ok(Envelope::Call { id, .. })) = stream.next().await else {
        panic!("expected a call envelope");
    };

    // A response nobody asked for, then the real one twice.
    sink.send(Envelope::success(workbridge::CallId::new(), json!("stray")))
        .await
        .unwrap();
    sink.send(Envelope::success(id, json!("first"))).await.unwrap();
    sink.send(Envelope::success(id, json!("second"))).await.unwrap();

    assert_eq!(pending.wait().await.unwrap(), json!("first"));
    assert!(master.pending_calls().is_empty());
    assert!(master.is_open());
}

#[tokio::test]
async fn call_with_timeout_gives_up() {
    let (master, _worker) = connected();

    let result = master
        .call_with_timeout::<Sleep>((5_000,), Duration::from_millis(20))
        .await;
    assert!(matches!(result, Err(BridgeError::Timeout { ref operation, .. }) if operation == "sleep"));
    assert!(master.pending_calls().is_empty());
}

#[tokio::test]
async fn late_registration_serves_later_calls() {
    let (master, worker) = connected();

    assert!(matches!(
        master.call::<AddEditEvent>(("block".to_string(),)).await,
        Err(BridgeError::UnknownHandler { .. })
    ));

    let edits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&edits);
    worker
        .register::<AddEditEvent, _, _>(move |(_block,)| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

    master.call::<AddEditEvent>(("block".to_string(),)).await.unwrap();
    assert_eq!(edits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn worker_can_call_master() {
    let (left, right) = Channel::pair();
    let reported = Arc::new(AtomicUsize::new(0));

    let registry = HandlerRegistry::new();
    registry
        .register_with::<UpdateKernels, _, _, _>(Arc::clone(&reported), |reported, (kernels,)| async move {
            reported.store(kernels.len(), Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    let _master = Bridge::master(left, registry);
    let worker = Bridge::worker(right, HandlerRegistry::new());

    worker
        .call::<UpdateKernels>((vec![json!({"id": "k1"}), json!({"id": "k2"})],))
        .await
        .unwrap();
    assert_eq!(reported.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn handlers_can_call_back_through_peer() {
    let (left, right) = Channel::pair();
    let reports = Arc::new(AtomicUsize::new(0));

    let master_registry = HandlerRegistry::new();
    master_registry
        .register_with::<UpdateKernels, _, _, _>(Arc::clone(&reports), |reports, _| async move {
            reports.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    let master = Bridge::master(left, master_registry);

    let worker = Bridge::start_with(Role::Worker, right, BridgeConfig::default(), |peer| {
        HandlerRegistry::new().with::<Restart, _, _>(move |()| {
            let peer = peer.clone();
            async move {
                peer.call::<UpdateKernels>((Vec::new(),)).await?;
                Ok::<_, anyhow::Error>(())
            }
        })
    })
    .unwrap();
    assert_eq!(worker.operations(), vec!["restart"]);

    // The master serves the callback while its own call is outstanding.
    master.call::<Restart>(()).await.unwrap();
    assert_eq!(reports.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn closed_channel_is_not_running() {
    let (left, right) = Channel::pair();
    let master = Bridge::master(left, HandlerRegistry::new());
    drop(right);

    let err = master.call::<Restart>(()).await.unwrap_err();
    assert!(err.is_not_running());
}

#[tokio::test]
async fn oversized_arguments_fail_only_that_call() {
    let (master, worker) = connected();

    let result = master.call::<Echo>(("x".repeat(OVERSIZED),)).await;
    assert!(matches!(result, Err(BridgeError::Codec(ref reason)) if reason.contains("frame limit")));

    assert!(master.is_open());
    assert!(worker.is_open());
    assert!(master.pending_calls().is_empty());
    assert_eq!(master.call::<Echo>(("next".to_string(),)).await.unwrap(), "next");
}

#[tokio::test]
async fn oversized_result_comes_back_as_handler_failure() {
    let (master, worker) = connected();

    match master.call::<Generate>((OVERSIZED,)).await {
        Err(BridgeError::HandlerThrew { operation, message, .. }) => {
            assert_eq!(operation, "generate");
            assert!(message.contains("too large"), "{message}");
        }
        other => panic!("unexpected result: {:?}", other.map(|s| s.len())),
    }

    assert!(worker.is_open());
    assert_eq!(master.call::<Generate>((3,)).await.unwrap(), "xxx");
}

#[tokio::test]
async fn frame_limit_is_configurable() {
    let (left, right) = Channel::pair();
    let _worker = Bridge::start(
        Role::Worker,
        right,
        BridgeConfig::new().with_max_frame_length(1024),
        worker_registry(),
    );
    let master = Bridge::master(left, HandlerRegistry::new());

    assert!(matches!(
        master.call::<Generate>((2048,)).await,
        Err(BridgeError::HandlerThrew { .. })
    ));
    assert_eq!(master.call::<Generate>((16,)).await.unwrap().len(), 16);
}

#[tokio::test]
async fn abandoned_calls_leave_no_pending_entries() {
    let (left, _right) = Channel::pair();
    let master = Bridge::master(left, HandlerRegistry::new());

    for _ in 0..100 {
        let abandoned =
            tokio::time::timeout(Duration::from_millis(1), master.call::<Restart>(())).await;
        assert!(abandoned.is_err());
    }
    drop(master.begin::<Restart>(()));

    assert!(master.pending_calls().is_empty());
    assert!(master.is_open());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handlers_start_in_arrival_order() {
    let (left, right) = Channel::pair();
    let started = Arc::new(Mutex::new(Vec::new()));

    let registry = HandlerRegistry::new();
    registry
        .register_with::<AddEditEvent, _, _, _>(Arc::clone(&started), |started, (block,)| async move {
            started.lock().unwrap().push(block);
            tokio::task::yield_now().await;
            Ok(())
        })
        .unwrap();
    let _worker = Bridge::worker(right, registry);
    let master = Bridge::master(left, HandlerRegistry::new());

    let blocks: Vec<String> = (0..200).map(|i| format!("block-{i}")).collect();
    let replies: Vec<_> = blocks
        .iter()
        .map(|block| master.begin::<AddEditEvent>((block.clone(),)))
        .collect();
    for reply in replies {
        reply.wait().await.unwrap();
    }

    assert_eq!(*started.lock().unwrap(), blocks);
}
