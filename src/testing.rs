//! Shared fixtures for unit and scenario tests.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::emitter::EventEmitter;
use crate::slice::{Request, RequestContext, Slice};
use crate::state::Record;

/// Let spawned flushes, schedulers and handlers run.
pub(crate) async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

/// A media element stand-in: a couple of properties plus native events.
pub(crate) struct MockMedia {
    volume: Mutex<f64>,
    paused: Mutex<bool>,
    events: EventEmitter<()>,
}

impl MockMedia {
    pub(crate) fn new() -> Self {
        Self::with_volume(1.0)
    }

    pub(crate) fn with_volume(volume: f64) -> Self {
        Self {
            volume: Mutex::new(volume),
            paused: Mutex::new(true),
            events: EventEmitter::new(),
        }
    }

    pub(crate) fn volume(&self) -> f64 {
        *self.volume.lock()
    }

    pub(crate) fn paused(&self) -> bool {
        *self.paused.lock()
    }

    pub(crate) fn events(&self) -> &EventEmitter<()> {
        &self.events
    }

    /// Change the volume the way a user would, firing `volumechange`.
    pub(crate) fn set_volume(&self, volume: f64) {
        *self.volume.lock() = volume;
        self.events.emit("volumechange", &());
    }

    pub(crate) fn play(&self) {
        *self.paused.lock() = false;
        self.events.emit("play", &());
    }

    pub(crate) fn pause(&self) {
        *self.paused.lock() = true;
        self.events.emit("pause", &());
    }
}

fn input_f64(input: &Value) -> f64 {
    input.as_f64().unwrap_or(0.0)
}

/// `volume` state with a clamping `changeVolume` request.
pub(crate) fn volume_slice() -> Slice<MockMedia> {
    Slice::<MockMedia>::new("volume")
        .state([("volume", json!(1.0))])
        .snapshot(|cx| Ok(Record::from_iter([("volume".to_string(), json!(cx.target.volume()))])))
        .subscribe(|cx| {
            let updater = cx.updater;
            let _ = cx
                .target
                .events()
                .on("volumechange", &cx.signal, move |_| updater.update());
            Ok(())
        })
        .request(
            "changeVolume",
            Request::from_fn(|input, cx: RequestContext<MockMedia>| {
                let volume = input_f64(&input).clamp(0.0, 1.0);
                cx.target.set_volume(volume);
                Ok(json!(volume))
            }),
        )
}

/// `paused` state with `play`/`pause` requests sharing the `playback` key.
pub(crate) fn playback_slice() -> Slice<MockMedia> {
    Slice::<MockMedia>::new("playback")
        .state([("paused", json!(true))])
        .snapshot(|cx| Ok(Record::from_iter([("paused".to_string(), json!(cx.target.paused()))])))
        .subscribe(|cx| {
            for event in ["play", "pause"] {
                let updater = cx.updater.clone();
                let _ = cx
                    .target
                    .events()
                    .on(event, &cx.signal, move |_| updater.update());
            }
            Ok(())
        })
        .request(
            "play",
            Request::new(|_, cx: RequestContext<MockMedia>| async move {
                cx.target.play();
                Ok(json!(cx.target.paused()))
            })
            .key("playback"),
        )
        .request(
            "pause",
            Request::new(|_, cx: RequestContext<MockMedia>| async move {
                cx.target.pause();
                Ok(json!(cx.target.paused()))
            })
            .key("playback"),
        )
}

/// Shorthand for an attached target shared with the test.
pub(crate) fn media() -> Arc<MockMedia> {
    Arc::new(MockMedia::new())
}
