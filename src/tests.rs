/// End-to-end scenarios: a store over a mock media element
use crate::testing::{MockMedia, media, playback_slice, settle, volume_slice};
use crate::{
    ErrorCode, Request, RequestContext, Slice, Store, StoreError, TaskPhase, Transaction,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn media_store() -> Store<MockMedia> {
    Store::builder()
        .slice(volume_slice())
        .slice(playback_slice())
        .build()
        .unwrap()
}

fn count_notifications(store: &Store<MockMedia>) -> (Arc<AtomicUsize>, Arc<Mutex<Vec<Vec<String>>>>, crate::Subscription) {
    let runs = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (runs_clone, seen_clone) = (runs.clone(), seen.clone());
    let sub = store.subscribe(move |_, changed| {
        runs_clone.fetch_add(1, Ordering::Relaxed);
        seen_clone.lock().push(changed.iter().cloned().collect());
    });
    (runs, seen, sub)
}

// =============================================================================
// Batching
// =============================================================================

#[tokio::test]
async fn native_events_in_one_turn_notify_once() {
    let store = media_store();
    let media = media();
    store.attach(media.clone());
    settle().await;
    let (runs, seen, _sub) = count_notifications(&store);

    media.set_volume(0.3);
    media.set_volume(0.4);
    media.play();
    assert_eq!(runs.load(Ordering::Relaxed), 0);

    settle().await;
    assert_eq!(runs.load(Ordering::Relaxed), 1);
    assert_eq!(seen.lock()[0], ["volume", "paused"]);
    assert_eq!(store.get("volume"), Some(json!(0.4)));
}

#[tokio::test]
async fn change_and_revert_in_one_turn_is_silent() {
    let store = media_store();
    let media = media();
    store.attach(media.clone());
    settle().await;
    let (runs, _, _sub) = count_notifications(&store);

    media.set_volume(0.5);
    media.set_volume(1.0);
    settle().await;

    assert_eq!(runs.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn transaction_batches_target_events() {
    let store = media_store();
    let media = media();
    store.attach(media.clone());
    settle().await;
    let (runs, seen, _sub) = count_notifications(&store);

    Transaction::run(|| {
        media.set_volume(0.2);
        media.play();
    });

    // Delivered synchronously at transaction exit.
    assert_eq!(runs.load(Ordering::Relaxed), 1);
    assert_eq!(seen.lock()[0], ["volume", "paused"]);
}

#[tokio::test]
async fn keyed_store_subscription_ignores_other_keys() {
    let store = media_store();
    let media = media();
    store.attach(media.clone());
    settle().await;

    let volume_changes = Arc::new(AtomicUsize::new(0));
    let volume_changes_clone = volume_changes.clone();
    let _sub = store.subscribe_keys(["volume"], move |state, _| {
        assert!(state.contains_key("paused"));
        volume_changes_clone.fetch_add(1, Ordering::Relaxed);
    });

    media.play();
    settle().await;
    assert_eq!(volume_changes.load(Ordering::Relaxed), 0);

    media.set_volume(0.1);
    settle().await;
    assert_eq!(volume_changes.load(Ordering::Relaxed), 1);
}

// =============================================================================
// Attachment lifecycle
// =============================================================================

#[tokio::test]
async fn attach_seeds_state_from_target() {
    let store = media_store();
    assert_eq!(store.get("volume"), Some(json!(1.0)));

    store.attach(MockMedia::with_volume(0.25));
    assert_eq!(store.get("volume"), Some(json!(0.25)));
    assert_eq!(store.get("paused"), Some(json!(true)));
}

#[tokio::test]
async fn detach_resets_to_initial_state() {
    let store = media_store();
    let media = Arc::new(MockMedia::with_volume(0.4));
    store.attach(media.clone());
    assert!(store.is_attached());

    assert!(store.detach());
    assert!(store.target().is_none());
    assert_eq!(store.get("volume"), Some(json!(1.0)));
    assert_eq!(media.events().listener_count("volumechange"), 0);
    assert!(!store.detach());
}

#[tokio::test]
async fn old_target_cannot_write_after_reattach() {
    cov_mark::check!(stale_update_ignored);

    // Hold on to the first attachment's updater to prove it goes inert,
    // not merely unreachable.
    let leaked = Arc::new(Mutex::new(None));
    let leaked_clone = leaked.clone();
    let store = Store::<MockMedia>::builder()
        .slice(volume_slice())
        .slice(Slice::<MockMedia>::new("spy").subscribe(move |cx| {
            leaked_clone.lock().get_or_insert(cx.updater);
            Ok(())
        }))
        .build()
        .unwrap();
    let a = Arc::new(MockMedia::with_volume(0.2));
    let b = Arc::new(MockMedia::with_volume(0.8));

    store.attach(a.clone());
    settle().await;
    assert_eq!(store.get("volume"), Some(json!(0.2)));

    store.detach();
    store.attach(b.clone());
    settle().await;

    a.set_volume(0.1);
    if let Some(updater) = leaked.lock().as_ref() {
        assert!(!updater.is_active());
        updater.patch([("volume", json!(0.0))]);
    }
    settle().await;

    assert_eq!(store.get("volume"), Some(json!(0.8)));
    assert_eq!(a.events().listener_count("volumechange"), 0);
    assert_eq!(b.events().listener_count("volumechange"), 1);
}

#[tokio::test]
async fn slice_teardown_runs_when_nothing_holds_the_updater() {
    let teardowns = Arc::new(AtomicUsize::new(0));
    let ended = Arc::new(AtomicUsize::new(0));
    let (teardowns_clone, ended_clone) = (teardowns.clone(), ended.clone());
    let store = Store::<MockMedia>::builder()
        .slice(Slice::<MockMedia>::new("lifecycle").subscribe(move |cx| {
            let teardowns = teardowns_clone.clone();
            let _ = cx.signal.on_abort(move |_| {
                teardowns.fetch_add(1, Ordering::Relaxed);
            });
            let ended = ended_clone.clone();
            let _ = cx.target.events().on("ended", &cx.signal, move |_| {
                ended.fetch_add(1, Ordering::Relaxed);
            });
            Ok(())
        }))
        .build()
        .unwrap();
    let media = media();

    store.attach(media.clone());
    assert_eq!(media.events().listener_count("ended"), 1);

    store.detach();
    media.events().emit("ended", &());

    assert_eq!(teardowns.load(Ordering::Relaxed), 1);
    assert_eq!(media.events().listener_count("ended"), 0);
    assert_eq!(ended.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn reattaching_identical_target_is_silent() {
    let store = media_store();
    let media = media();
    store.attach(media.clone());
    settle().await;
    let (runs, _, _sub) = count_notifications(&store);

    store.attach(media.clone());
    settle().await;

    assert_eq!(runs.load(Ordering::Relaxed), 0);
    assert_eq!(media.events().listener_count("volumechange"), 1);
}

#[tokio::test]
async fn destroy_round_trip() {
    let store = media_store();
    let media = media();
    store.attach(media.clone());

    store.destroy();
    store.destroy();

    assert!(store.is_destroyed());
    assert!(store.target().is_none());
    let err = store.request("changeVolume", json!(0.5)).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::Destroyed));
    assert_eq!(media.volume(), 1.0);
    assert_eq!(media.events().listener_count("volumechange"), 0);
}

#[tokio::test]
async fn destroy_rejects_in_flight_requests() {
    let store = Store::<MockMedia>::builder()
        .slice(Slice::<MockMedia>::new("slow").request(
            "load",
            Request::new(|_, cx: RequestContext<MockMedia>| async move {
                Err(cx.signal.aborted().await)
            }),
        ))
        .build()
        .unwrap();
    store.attach(MockMedia::new());

    let load = store.request("load", Value::Null);
    settle().await;
    store.destroy();

    assert_eq!(load.await.unwrap_err().code(), Some(ErrorCode::Destroyed));
    assert!(store.queue().tasks().is_empty());
}

#[tokio::test]
async fn destroy_reaches_task_whose_record_was_replaced() {
    let store = track_store();
    store.attach(MockMedia::new());

    let audio = store.request("select", json!({ "kind": "audio" }));
    settle().await;
    let text = store.request("select", json!({ "kind": "text" }));
    settle().await;
    assert_eq!(store.queue().task("select").map(|task| task.id), text.id());

    store.destroy();

    let audio = tokio::time::timeout(Duration::from_secs(1), audio)
        .await
        .expect("replaced task settles on destroy");
    assert_eq!(audio.unwrap_err().code(), Some(ErrorCode::Destroyed));
    assert_eq!(text.await.unwrap_err().code(), Some(ErrorCode::Destroyed));
}

// =============================================================================
// Requests
// =============================================================================

/// `select` waits until aborted; its key is derived from the track kind.
fn track_store() -> Store<MockMedia> {
    Store::builder()
        .slice(Slice::<MockMedia>::new("tracks").request(
            "select",
            Request::new(|_, cx: RequestContext<MockMedia>| async move {
                Err(cx.signal.aborted().await)
            })
            .key_fn(|input| format!("track:{}", input["kind"])),
        ))
        .build()
        .unwrap()
}

#[tokio::test]
async fn change_volume_clamps_to_unit_range() {
    let store = media_store();
    let media = media();
    store.attach(media.clone());

    let loud = store.request("changeVolume", json!(1.5)).await.unwrap();
    assert_eq!(loud, json!(1.0));
    assert_eq!(media.volume(), 1.0);

    let quiet = store.request("changeVolume", json!(-0.5)).await.unwrap();
    assert_eq!(quiet, json!(0.0));
    assert_eq!(media.volume(), 0.0);

    settle().await;
    assert_eq!(store.get("volume"), Some(json!(0.0)));
}

#[tokio::test]
async fn play_then_pause_in_one_turn_keeps_only_pause() {
    let store = media_store();
    let media = media();
    store.attach(media.clone());
    media.play();
    settle().await;
    assert_eq!(store.get("paused"), Some(json!(false)));

    let play = store.request("play", Value::Null);
    let pause = store.request("pause", Value::Null);

    let play_err = play.await.unwrap_err();
    assert!(play_err.is_cancellation());
    assert_eq!(play_err.code(), Some(ErrorCode::Superseded));
    assert_eq!(pause.await.unwrap(), json!(true));

    settle().await;
    assert!(media.paused());
    assert_eq!(store.get("paused"), Some(json!(true)));
    assert!(store.queue().task("play").is_none());
}

#[tokio::test]
async fn pending_request_superseded_across_names() {
    let store = Store::<MockMedia>::builder()
        .slice(
            Slice::<MockMedia>::new("source")
                .request(
                    "load",
                    Request::new(|_, cx: RequestContext<MockMedia>| async move {
                        Err(cx.signal.aborted().await)
                    })
                    .key("source"),
                )
                .request(
                    "unload",
                    Request::from_fn(|_, _: RequestContext<MockMedia>| Ok(json!("unloaded")))
                        .key("source"),
                ),
        )
        .build()
        .unwrap();
    store.attach(MockMedia::new());

    let phases = Arc::new(Mutex::new(Vec::new()));
    let phases_clone = phases.clone();
    let _watch = store.queue().subscribe_names(["load"], move |tasks, _| {
        if let Some(task) = tasks.get("load") {
            phases_clone.lock().push(task.status.phase());
        }
    });

    let load = store.request("load", Value::Null);
    settle().await;
    assert!(store.queue().task("load").unwrap().is_pending());

    let unload = store.request("unload", Value::Null);
    assert_eq!(load.await.unwrap_err().code(), Some(ErrorCode::Superseded));
    assert_eq!(unload.await.unwrap(), json!("unloaded"));
    settle().await;

    let record = store.queue().task("load").unwrap();
    assert!(record.is_cancelled());
    assert_eq!(*phases.lock(), [TaskPhase::Pending, TaskPhase::Error]);
}

#[tokio::test]
async fn dynamic_keys_only_supersede_matching_input() {
    let started = Arc::new(AtomicUsize::new(0));
    let started_clone = started.clone();
    let store = Store::<MockMedia>::builder()
        .slice(Slice::<MockMedia>::new("tracks").request(
            "select",
            Request::from_fn(move |input, _: RequestContext<MockMedia>| {
                started_clone.fetch_add(1, Ordering::Relaxed);
                Ok(input)
            })
            .key_fn(|input| format!("track:{}", input["kind"])),
        ))
        .build()
        .unwrap();
    store.attach(MockMedia::new());

    let audio = store.request("select", json!({ "kind": "audio", "id": 1 }));
    let text = store.request("select", json!({ "kind": "text", "id": 2 }));
    let audio_again = store.request("select", json!({ "kind": "audio", "id": 3 }));

    assert!(audio.await.is_err());
    assert!(text.await.is_ok());
    assert_eq!(audio_again.await.unwrap()["id"], json!(3));
    assert_eq!(started.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn same_key_supersedes_task_whose_record_was_replaced() {
    let store = track_store();
    store.attach(MockMedia::new());

    let audio = store.request("select", json!({ "kind": "audio" }));
    settle().await;
    let text = store.request("select", json!({ "kind": "text" }));
    settle().await;
    let audio_again = store.request("select", json!({ "kind": "audio" }));

    let audio = tokio::time::timeout(Duration::from_secs(1), audio)
        .await
        .expect("replaced task is superseded");
    assert_eq!(audio.unwrap_err().code(), Some(ErrorCode::Superseded));

    settle().await;
    assert_eq!(store.queue().task("select").map(|task| task.id), audio_again.id());
    store.queue().abort(Some("select"));
    assert_eq!(text.await.unwrap_err().code(), Some(ErrorCode::Aborted));
    assert_eq!(audio_again.await.unwrap_err().code(), Some(ErrorCode::Aborted));
}

#[tokio::test]
async fn reset_clears_settled_requests_only() {
    let store = Store::<MockMedia>::builder()
        .slice(volume_slice())
        .slice(Slice::<MockMedia>::new("slow").request(
            "load",
            Request::new(|_, cx: RequestContext<MockMedia>| async move {
                Err(cx.signal.aborted().await)
            }),
        ))
        .build()
        .unwrap();
    store.attach(MockMedia::new());

    store.request("changeVolume", json!(0.5)).await.unwrap();
    let load = store.request("load", Value::Null);
    settle().await;

    store.queue().reset(Some("load"));
    assert!(store.queue().task("load").unwrap().is_pending());

    store.queue().reset(Some("changeVolume"));
    assert!(store.queue().task("changeVolume").is_none());

    store.queue().abort(Some("load"));
    assert_eq!(load.await.unwrap_err().code(), Some(ErrorCode::Aborted));
}

#[tokio::test]
async fn handler_failure_agrees_across_channels() {
    let store = Store::<MockMedia>::builder()
        .slice(Slice::<MockMedia>::new("broken").request(
            "seek",
            Request::from_fn(|_, _: RequestContext<MockMedia>| Err(StoreError::msg("not seekable"))),
        ))
        .build()
        .unwrap();
    store.attach(MockMedia::new());

    let err = store.request("seek", json!(10)).await.unwrap_err();
    let task = store.queue().task("seek").unwrap();

    assert_eq!(err.to_string(), "not seekable");
    assert_eq!(task.error().map(ToString::to_string), Some(err.to_string()));
    assert!(!task.is_cancelled());
    assert!(!err.is_cancellation());
}

#[tokio::test(start_paused = true)]
async fn debounced_request_runs_once_after_quiet_period() {
    let store = Store::<MockMedia>::builder()
        .slice(Slice::<MockMedia>::new("volume").request(
            "changeVolume",
            Request::from_fn(|input, cx: RequestContext<MockMedia>| {
                let volume = input.as_f64().unwrap_or(0.0);
                cx.target.set_volume(volume);
                Ok(json!(volume))
            })
            .debounce(Duration::from_millis(50)),
        ))
        .build()
        .unwrap();
    let media = media();
    store.attach(media.clone());

    let first = store.request("changeVolume", json!(0.1));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = store.request("changeVolume", json!(0.2));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(media.volume(), 1.0);

    assert_eq!(first.await.unwrap_err().code(), Some(ErrorCode::Superseded));
    assert_eq!(second.await.unwrap(), json!(0.2));
    assert_eq!(media.volume(), 0.2);
}

#[tokio::test]
async fn async_guard_waits_before_handler() {
    let ready = Arc::new(tokio::sync::Notify::new());
    let ready_clone = ready.clone();
    let store = Store::<MockMedia>::builder()
        .slice(
            Slice::<MockMedia>::new("playback").request(
                "play",
                Request::from_fn(|_, cx: RequestContext<MockMedia>| {
                    cx.target.play();
                    Ok(Value::Null)
                })
                .guard_async(move |_| {
                    let ready = ready_clone.clone();
                    async move {
                        ready.notified().await;
                        true
                    }
                }),
            ),
        )
        .build()
        .unwrap();
    let media = media();
    store.attach(media.clone());

    let play = store.request("play", Value::Null);
    settle().await;
    assert!(media.paused());
    assert!(store.queue().task("play").unwrap().is_pending());

    ready.notify_one();
    play.await.unwrap();
    assert!(!media.paused());
}

#[tokio::test]
async fn superseded_while_guarded_never_reaches_handler() {
    let gate = Arc::new(tokio::sync::Notify::new());
    let handled = Arc::new(Mutex::new(Vec::new()));
    let (gate_clone, handled_clone) = (gate.clone(), handled.clone());
    let store = Store::<MockMedia>::builder()
        .slice(
            Slice::<MockMedia>::new("seeking").request(
                "seek",
                Request::from_fn(move |input, _: RequestContext<MockMedia>| {
                    handled_clone.lock().push(input.clone());
                    Ok(input)
                })
                .guard_async(move |_| {
                    let gate = gate_clone.clone();
                    async move {
                        gate.notified().await;
                        true
                    }
                }),
            ),
        )
        .build()
        .unwrap();
    store.attach(MockMedia::new());

    let first = store.request("seek", json!(10));
    settle().await;
    assert!(store.queue().task("seek").unwrap().is_pending());

    let second = store.request("seek", json!(20));
    let err = first.await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::Superseded));
    assert!(err.is_cancellation());

    settle().await;
    gate.notify_one();
    assert_eq!(second.await.unwrap(), json!(20));
    assert_eq!(*handled.lock(), [json!(20)]);
}
