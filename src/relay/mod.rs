//! Live frame fan-out
//!
//! Viewers subscribe per device. The first viewer of a device makes the
//! device start capturing, the last one leaving makes it stop, and every
//! frame the device sends in between is copied to all current viewers.
//!
//! Start/stop commands are issued by a capture-control task per device, in
//! the order that device's viewer-count transitions happened, so a slow
//! store write for one device never holds up another. While a device
//! captures, its task also drains frames the device appends to
//! `frames/{device}` in the store.

pub mod multipart;

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::correlator::{Correlator, RequestKind};
use crate::dispatch::CommandDispatcher;
use crate::store::{SharedStoreRef, StoreEvent, StorePath, validate_segment};
use crate::{Error, Result};

/// Command telling a device to start streaming frames
pub const START_CAPTURE: &str = "startCamera";

/// Command telling a device to stop streaming frames
pub const STOP_CAPTURE: &str = "stopCamera";

/// Store node devices may append frames under
pub const FRAMES_ROOT: &str = "frames";

/// Camera a device captures with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    Front,
    #[default]
    Back,
}

impl CameraFacing {
    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Front => "front",
            Self::Back => "back",
        }
    }
}

impl fmt::Display for CameraFacing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CameraFacing {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "front" => Ok(Self::Front),
            "back" | "rear" => Ok(Self::Back),
            other => Err(Error::Validation(format!("unknown camera '{other}'"))),
        }
    }
}

/// Handle of one viewer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewerId(u64);

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "viewer-{}", self.0)
    }
}

/// Relay tuning
#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    /// Interval the device is asked to capture at
    pub frame_interval: Duration,
    /// Frames buffered per viewer before frames are skipped for it
    pub viewer_capacity: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(500),
            viewer_capacity: 8,
        }
    }
}

/// Progress of the start-capture command of one watch session
#[derive(Debug, Clone, PartialEq, Eq)]
enum CaptureState {
    Starting,
    Running,
    Failed(String),
}

/// Viewers of one device
#[derive(Debug)]
struct DeviceViewers {
    camera: CameraFacing,
    /// ID of the viewer that opened this watch session
    session: ViewerId,
    started: watch::Receiver<CaptureState>,
    viewers: HashMap<ViewerId, mpsc::Sender<Bytes>>,
}

#[derive(Debug)]
enum Control {
    Start {
        camera: CameraFacing,
        started: watch::Sender<CaptureState>,
    },
    Stop,
    Sync(oneshot::Sender<()>),
}

/// Control queue of one device's capture worker
#[derive(Debug)]
struct DeviceWorker {
    tx: mpsc::UnboundedSender<Control>,
    /// Messages sent but not yet handled
    pending: usize,
}

#[derive(Debug)]
struct RelayInner {
    devices: DashMap<String, DeviceViewers>,
    workers: DashMap<String, DeviceWorker>,
    next_viewer: AtomicU64,
    dispatcher: CommandDispatcher,
    store: SharedStoreRef,
    this: Weak<RelayInner>,
    options: RelayOptions,
}

impl RelayInner {
    /// Queue a capture command for `device_id`, spawning its worker if idle
    fn send_control(&self, device_id: &str, message: Control) {
        let mut worker = match self.workers.entry(device_id.to_string()) {
            Entry::Occupied(entry) if !entry.get().tx.is_closed() => entry.into_ref(),
            entry => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    tracing::warn!(device_id = %device_id, "no runtime for capture control; command dropped");
                    return;
                };
                let (tx, rx) = mpsc::unbounded_channel();
                let control = CaptureControl {
                    device_id: device_id.to_string(),
                    dispatcher: self.dispatcher.clone(),
                    store: Arc::clone(&self.store),
                    relay: self.this.clone(),
                    frame_interval: self.options.frame_interval,
                    ingress: None,
                };
                runtime.spawn(control.run(rx));
                entry.insert(DeviceWorker { tx, pending: 0 })
            }
        };

        if worker.tx.send(message).is_ok() {
            worker.pending += 1;
        } else {
            tracing::warn!(device_id = %device_id, "capture control task is gone; command dropped");
        }
    }

    /// Account for one handled message; returns whether the worker should exit
    fn control_done(&self, device_id: &str, capturing: bool) -> bool {
        let Entry::Occupied(mut entry) = self.workers.entry(device_id.to_string()) else {
            return true;
        };
        let worker = entry.get_mut();
        worker.pending = worker.pending.saturating_sub(1);
        if worker.pending == 0 && !capturing {
            entry.remove();
            return true;
        }
        false
    }

    /// Remove one viewer; emits stop-capture if it was the last one
    fn detach(&self, device_id: &str, viewer: ViewerId, emit_stop: bool) -> bool {
        let Entry::Occupied(mut entry) = self.devices.entry(device_id.to_string()) else {
            return false;
        };
        if entry.get_mut().viewers.remove(&viewer).is_none() {
            return false;
        }
        tracing::debug!(device_id = %device_id, viewer = %viewer, "viewer detached");

        if entry.get().viewers.is_empty() {
            // Queue while still holding the entry so a racing subscribe
            // cannot get its start in ahead of this stop
            if emit_stop {
                self.send_control(device_id, Control::Stop);
            }
            entry.remove();
        }
        true
    }

    /// Drop a watch session whose capture never started, with every viewer in it
    fn abandon(&self, device_id: &str, session: ViewerId) {
        if let Some((_, dropped)) = self
            .devices
            .remove_if(device_id, |_, viewers| viewers.session == session)
        {
            tracing::debug!(
                device_id = %device_id,
                viewers = dropped.viewers.len(),
                "watch session abandoned"
            );
        }
    }

    fn relay_frame(&self, device_id: &str, frame: &[u8]) -> usize {
        let Entry::Occupied(mut entry) = self.devices.entry(device_id.to_string()) else {
            return 0;
        };

        let part = multipart::encode_part(frame);
        let mut delivered = 0;
        entry.get_mut().viewers.retain(|viewer, tx| match tx.try_send(part.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::trace!(device_id = %device_id, viewer = %viewer, "viewer lagging, frame skipped");
                true
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(device_id = %device_id, viewer = %viewer, "viewer connection closed");
                false
            }
        });

        if entry.get().viewers.is_empty() {
            self.send_control(device_id, Control::Stop);
            entry.remove();
        }
        delivered
    }
}

/// Fans device frames out to live viewers
#[derive(Debug, Clone)]
pub struct FrameRelay {
    inner: Arc<RelayInner>,
    correlator: Arc<Correlator>,
}

impl FrameRelay {
    /// Create a relay
    ///
    /// Capture commands run on one worker task per device, spawned on the
    /// current Tokio runtime when the device is first watched.
    #[must_use]
    pub fn new(
        dispatcher: CommandDispatcher,
        store: SharedStoreRef,
        correlator: Arc<Correlator>,
        options: RelayOptions,
    ) -> Self {
        let inner = Arc::new_cyclic(|this| RelayInner {
            devices: DashMap::new(),
            workers: DashMap::new(),
            next_viewer: AtomicU64::new(1),
            dispatcher,
            store,
            this: this.clone(),
            options,
        });

        Self { inner, correlator }
    }

    /// Start watching `device_id`
    ///
    /// The first viewer of a device opens a watch session and queues the
    /// start-capture command; its camera choice applies until the device
    /// stops capturing. Every viewer of the session returns once that
    /// command is stored.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for a bad device ID and
    /// `Error::StoreUnavailable` if the start-capture command could not be
    /// stored. In that case the whole session is dropped, so the next
    /// viewer tries to start capture again.
    pub async fn subscribe(&self, device_id: &str, camera: CameraFacing) -> Result<ViewerStream> {
        validate_segment(device_id)?;

        let id = ViewerId(self.inner.next_viewer.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.inner.options.viewer_capacity.max(1));

        let (session, mut started) = {
            let mut opened = None;
            let mut entry = self
                .inner
                .devices
                .entry(device_id.to_string())
                .or_insert_with(|| {
                    let (sender, receiver) = watch::channel(CaptureState::Starting);
                    opened = Some(sender);
                    DeviceViewers {
                        camera,
                        session: id,
                        started: receiver,
                        viewers: HashMap::new(),
                    }
                });
            entry.viewers.insert(id, tx);

            if let Some(started) = opened {
                self.inner.send_control(
                    device_id,
                    Control::Start {
                        camera: entry.camera,
                        started,
                    },
                );
            }
            (entry.session, entry.started.clone())
        };

        let mut stream = ViewerStream {
            device_id: device_id.to_string(),
            id,
            rx,
            relay: Some(Arc::downgrade(&self.inner)),
        };
        let first = session == id;
        tracing::debug!(device_id = %device_id, viewer = %id, first, "viewer attached");

        if let Err(e) = wait_started(&mut started).await {
            // Capture never started, so leaving must not stop it
            stream.relay = None;
            self.inner.detach(device_id, id, false);
            self.inner.abandon(device_id, session);
            tracing::warn!(device_id = %device_id, viewer = %id, error = %e, "failed to start capture");
            return Err(e);
        }

        Ok(stream)
    }

    /// Stop delivering to `viewer`
    ///
    /// Returns `false` if the viewer was not subscribed.
    pub fn unsubscribe(&self, device_id: &str, viewer: ViewerId) -> bool {
        self.inner.detach(device_id, viewer, true)
    }

    /// Copy `frame` to every viewer of `device_id`
    ///
    /// Returns the number of viewers the frame was queued for.
    #[must_use]
    pub fn relay_frame(&self, device_id: &str, frame: &[u8]) -> usize {
        self.inner.relay_frame(device_id, frame)
    }

    /// Ask the device for a single still image
    ///
    /// # Errors
    ///
    /// Returns the correlator's errors, or `Error::NotFound` if the device
    /// answered without an image
    pub async fn snapshot(
        &self,
        device_id: &str,
        camera: CameraFacing,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        let reply = self
            .correlator
            .await_response(device_id, RequestKind::Snapshot, json!({ "camera": camera }), timeout)
            .await?;

        let image = reply
            .result(RequestKind::Snapshot)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::NotFound(format!("device {device_id} answered without an image")))?;
        multipart::decode_image(image)
    }

    /// Number of viewers currently watching `device_id`
    #[must_use]
    pub fn viewer_count(&self, device_id: &str) -> usize {
        self.inner
            .devices
            .get(device_id)
            .map_or(0, |entry| entry.viewers.len())
    }

    /// Devices with at least one viewer
    #[must_use]
    pub fn watched_devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self.inner.devices.iter().map(|e| e.key().clone()).collect();
        devices.sort();
        devices
    }

    /// Wait until every capture command queued so far has been handled
    pub async fn sync(&self) {
        let devices: Vec<String> = self.inner.workers.iter().map(|w| w.key().clone()).collect();
        let mut handled = Vec::with_capacity(devices.len());
        for device_id in devices {
            let (tx, rx) = oneshot::channel();
            self.inner.send_control(&device_id, Control::Sync(tx));
            handled.push(rx);
        }
        futures::future::join_all(handled).await;
    }

    /// Close every viewer stream and stop all captures
    pub async fn shutdown(&self) {
        let devices = self.watched_devices();
        for device_id in devices {
            if let Entry::Occupied(entry) = self.inner.devices.entry(device_id.clone()) {
                self.inner.send_control(&device_id, Control::Stop);
                entry.remove();
            }
        }
        self.sync().await;
        tracing::info!("frame relay shut down");
    }
}

/// Wait for the session's start-capture outcome
async fn wait_started(started: &mut watch::Receiver<CaptureState>) -> Result<()> {
    let state = started
        .wait_for(|state| *state != CaptureState::Starting)
        .await
        .map(|state| state.clone())
        .map_err(|_| Error::StoreUnavailable("capture control stopped".to_string()))?;

    match state {
        CaptureState::Failed(reason) => Err(Error::StoreUnavailable(reason)),
        CaptureState::Starting | CaptureState::Running => Ok(()),
    }
}

/// Framed multipart parts for one viewer
///
/// Dropping the stream unsubscribes the viewer.
#[derive(Debug)]
pub struct ViewerStream {
    device_id: String,
    id: ViewerId,
    rx: mpsc::Receiver<Bytes>,
    relay: Option<Weak<RelayInner>>,
}

impl ViewerStream {
    /// Handle of this viewer
    #[must_use]
    pub const fn id(&self) -> ViewerId {
        self.id
    }

    /// Device being watched
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl Stream for ViewerStream {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for ViewerStream {
    fn drop(&mut self) {
        if let Some(relay) = self.relay.take().and_then(|weak| weak.upgrade()) {
            relay.detach(&self.device_id, self.id, true);
        }
    }
}

/// Issues one device's capture commands and drains its stored frames
///
/// Runs until the device is neither capturing nor has commands queued.
struct CaptureControl {
    device_id: String,
    dispatcher: CommandDispatcher,
    store: SharedStoreRef,
    relay: Weak<RelayInner>,
    frame_interval: Duration,
    /// Frame ingress task, present while the device captures
    ingress: Option<JoinHandle<()>>,
}

impl CaptureControl {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Control>) {
        while let Some(message) = rx.recv().await {
            match message {
                Control::Start { camera, started } => {
                    let state = match self.start(camera).await {
                        Ok(()) => CaptureState::Running,
                        Err(e) => CaptureState::Failed(e.to_string()),
                    };
                    let _ = started.send(state);
                }
                Control::Stop => self.stop().await,
                Control::Sync(done) => {
                    let _ = done.send(());
                }
            }

            let Some(relay) = self.relay.upgrade() else {
                break;
            };
            if relay.control_done(&self.device_id, self.ingress.is_some()) {
                break;
            }
        }

        if let Some(task) = self.ingress.take() {
            task.abort();
        }
        tracing::trace!(device_id = %self.device_id, "capture control idle");
    }

    async fn start(&mut self, camera: CameraFacing) -> Result<()> {
        if self.ingress.is_some() {
            return Ok(());
        }

        let interval_ms = u64::try_from(self.frame_interval.as_millis()).unwrap_or(u64::MAX);
        self.dispatcher
            .dispatch(
                &self.device_id,
                START_CAPTURE,
                Some(json!({ "camera": camera, "intervalMs": interval_ms })),
            )
            .await?;

        self.ingress = Some(tokio::spawn(pump_frames(
            Arc::clone(&self.store),
            self.relay.clone(),
            self.device_id.clone(),
        )));

        tracing::info!(device_id = %self.device_id, camera = %camera, "capture started");
        Ok(())
    }

    async fn stop(&mut self) {
        let Some(task) = self.ingress.take() else {
            return;
        };
        task.abort();

        match self.dispatcher.dispatch(&self.device_id, STOP_CAPTURE, None).await {
            Ok(_) => tracing::info!(device_id = %self.device_id, "capture stopped"),
            Err(e) => tracing::warn!(device_id = %self.device_id, error = %e, "failed to queue stop-capture"),
        }
    }
}

/// Relay frames the device appends under `frames/{device}`, deleting each
async fn pump_frames(store: SharedStoreRef, relay: Weak<RelayInner>, device_id: String) {
    let path = match StorePath::new(FRAMES_ROOT).and_then(|p| p.child(&device_id)) {
        Ok(path) => path,
        Err(e) => {
            tracing::warn!(device_id = %device_id, error = %e, "invalid frame path");
            return;
        }
    };
    let mut frames = match store.watch_children(&path).await {
        Ok(sub) => sub,
        Err(e) => {
            tracing::warn!(device_id = %device_id, error = %e, "failed to watch stored frames");
            return;
        }
    };

    while let Some(event) = frames.next().await {
        let (key, value) = match event {
            Ok(StoreEvent::ChildAdded { key, value }) => (key, value),
            Ok(StoreEvent::Value(_)) => continue,
            Err(e) => {
                tracing::warn!(device_id = %device_id, error = %e, "stored frame watch failed");
                break;
            }
        };
        let Some(relay) = relay.upgrade() else {
            break;
        };

        let encoded = value.get("image").and_then(Value::as_str).or_else(|| value.as_str());
        match encoded.map(multipart::decode_image) {
            Some(Ok(frame)) => {
                let delivered = relay.relay_frame(&device_id, &frame);
                tracing::trace!(device_id = %device_id, delivered, "stored frame relayed");
            }
            Some(Err(e)) => tracing::debug!(device_id = %device_id, error = %e, "stored frame dropped"),
            None => tracing::debug!(device_id = %device_id, key = %key, "stored frame has no image"),
        }
        drop(relay);

        if let Ok(child) = path.child(&key) {
            if let Err(e) = store.remove(&child).await {
                tracing::debug!(path = %child, error = %e, "failed to delete relayed frame");
            }
        }
    }
}
