/// Detection engine
///
/// Wires the media session, audio analyzer, trigger policy, capture step,
/// inference client and state machine together. A display-cadence polling
/// loop samples loudness and runs the trigger policy; each fired trigger runs
/// one capture/inference cycle on its own task. At most one cycle is in
/// flight at any time.

use crate::analyzer::RollingAudioAnalyzer;
use crate::audio_buffer::AudioTap;
use crate::capture::{capture_bundle, CaptureBundle};
use crate::config::{
    ConfigError, EngineConfig, ThresholdCell, AUTO_SAVE_DWELL_MS, EVENT_QUEUE_CAPACITY,
};
use crate::inference::{HttpInferenceClient, InferenceClient, InferenceError};
use crate::media::{MediaBackend, MediaError, MediaSession, MediaSourceManager};
use crate::state::{CycleResolution, CycleTicket, DetectionResult, DetectionStateMachine, EngineState};
use crate::surface::{EngineEvent, EngineStats, SessionSnapshot};
use crate::trigger::{effective_threshold, PolicyInput, TriggerKind, TriggerPolicy};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Inference client error: {0}")]
    Inference(#[from] InferenceError),
}

/// Mutable engine state, guarded by one lock
struct EngineInner {
    machine: DetectionStateMachine,
    policy: TriggerPolicy,
    analyzer: Option<RollingAudioAnalyzer>,
    session: Option<Arc<MediaSession>>,
    camera_error: Option<String>,
    loudness: f32,
    is_running: bool,
    stats: EngineStats,
}

impl EngineInner {
    fn new() -> Self {
        Self {
            machine: DetectionStateMachine::new(),
            policy: TriggerPolicy::new(),
            analyzer: None,
            session: None,
            camera_error: None,
            loudness: 0.0,
            is_running: false,
            stats: EngineStats::default(),
        }
    }

    fn snapshot(&self, threshold: f32) -> SessionSnapshot {
        let state = self.machine.state();
        let baseline = self.analyzer.as_ref().and_then(|a| a.baseline().value());

        SessionSnapshot {
            state,
            status_label: state.status_label().to_string(),
            is_running: self.is_running,
            camera_ready: self.session.as_ref().map(|s| s.is_live()).unwrap_or(false),
            camera_error: self.camera_error.clone(),
            audio_available: self.analyzer.as_ref().map(|a| a.has_audio()).unwrap_or(false),
            loudness: self.loudness,
            baseline,
            threshold,
            effective_threshold: effective_threshold(threshold, baseline),
            visual_feed: self.machine.visual_feed().to_string(),
            audio_feed: self.machine.audio_feed().to_string(),
            audio_summary: self.machine.audio_summary(),
            detection: self.machine.result().cloned(),
            annotated_image: self.machine.annotated_image(),
            toast: self.machine.toast().map(str::to_string),
            last_error: self.machine.last_error().map(str::to_string),
            is_frozen: state.is_frozen(),
            is_auto_saving: state == EngineState::AutoSaving,
        }
    }
}

/// State shared with the polling loop and cycle tasks
struct Shared {
    config: EngineConfig,
    client: Arc<dyn InferenceClient>,
    threshold: ThresholdCell,
    inner: RwLock<EngineInner>,
    in_flight: AtomicBool,
    event_tx: mpsc::Sender<EngineEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

/// Clears the in-flight flag when the cycle task ends, on every path
struct InFlightGuard(Arc<Shared>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::Release);
    }
}

impl Shared {
    /// Queue an event; dropped when the host is not draining the queue
    fn emit(&self, event: EngineEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("Event queue full ({}), dropping event", EVENT_QUEUE_CAPACITY)
            }
            Err(TrySendError::Closed(_)) => debug!("No event receiver"),
        }
    }

    /// Publish a snapshot and report a state change since `before`
    fn commit(&self, inner: &EngineInner, before: EngineState) {
        let after = inner.machine.state();
        if before != after {
            self.emit(EngineEvent::StateChanged {
                from: before,
                to: after,
            });
        }

        let snapshot = inner.snapshot(self.threshold.get());
        self.snapshot_tx.send_if_modified(|current| {
            if *current != snapshot {
                *current = snapshot;
                true
            } else {
                false
            }
        });
    }

    /// One polling-loop iteration
    async fn tick(self: &Arc<Self>, token: &CancellationToken) {
        let base_threshold = self.threshold.get();
        let mut inner = self.inner.write().await;
        let before = inner.machine.state();
        inner.stats.ticks += 1;

        let Some(reading) = inner.analyzer.as_mut().map(|a| a.tick()) else {
            return;
        };
        inner.loudness = reading.loudness;

        if reading.baseline_ready {
            if let Some(baseline) = reading.baseline {
                self.emit(EngineEvent::BaselineReady { baseline });
            }
        }

        // Claim the in-flight slot before deciding, release it if nothing fires
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let input = PolicyInput {
                loudness: reading.loudness,
                baseline: reading.baseline,
                base_threshold,
                state: before,
            };

            let fired = inner.policy.evaluate(&input, Instant::now());
            let ticket = fired.and_then(|kind| inner.machine.begin_detection(kind));

            match (ticket, inner.session.clone()) {
                (Some(ticket), Some(session)) => {
                    match ticket.kind {
                        TriggerKind::AudioVisual => inner.stats.audio_triggers += 1,
                        TriggerKind::VisualOnly => inner.stats.visual_triggers += 1,
                    }
                    self.emit(EngineEvent::TriggerFired {
                        kind: ticket.kind,
                        detection_id: ticket.id,
                    });

                    let tap = inner
                        .analyzer
                        .as_ref()
                        .and_then(|a| a.tap().cloned());
                    let guard = InFlightGuard(self.clone());
                    tokio::spawn(run_cycle(
                        self.clone(),
                        guard,
                        session,
                        tap,
                        ticket,
                        token.clone(),
                    ));
                }
                (Some(ticket), None) => {
                    if inner.machine.abort_cycle(&ticket) {
                        inner.stats.cycles_aborted += 1;
                    }
                    self.in_flight.store(false, Ordering::Release);
                }
                (None, _) => {
                    self.in_flight.store(false, Ordering::Release);
                }
            }
        }

        self.commit(&inner, before);
    }
}

/// Capture, submit, and resolve one detection cycle
async fn run_cycle(
    shared: Arc<Shared>,
    _guard: InFlightGuard,
    session: Arc<MediaSession>,
    tap: Option<Arc<AudioTap>>,
    ticket: CycleTicket,
    token: CancellationToken,
) {
    let kind = ticket.kind;
    let video = session.video();
    let bundle = match tokio::task::spawn_blocking(move || {
        capture_bundle(kind, video.as_ref(), tap.as_deref())
    })
    .await
    {
        Ok(bundle) => bundle,
        Err(e) => {
            error!("Capture task failed: {}", e);
            CaptureBundle {
                kind,
                image: None,
                audio: None,
            }
        }
    };

    if bundle.is_empty() {
        let mut inner = shared.inner.write().await;
        let before = inner.machine.state();
        if inner.machine.abort_cycle(&ticket) {
            inner.stats.cycles_aborted += 1;
        }
        shared.commit(&inner, before);
        return;
    }

    let outcome = shared.client.submit(&bundle).await;

    let mut inner = shared.inner.write().await;
    let before = inner.machine.state();

    match outcome {
        Ok(prediction) => {
            let resolution = inner
                .machine
                .apply_prediction(&ticket, &prediction, bundle.image.as_ref());

            match resolution {
                CycleResolution::Stale => {}
                CycleResolution::AutoSave { detection_id } => {
                    inner.stats.cycles_succeeded += 1;
                    tokio::spawn(auto_save_after_dwell(
                        shared.clone(),
                        detection_id,
                        token.child_token(),
                    ));
                }
                CycleResolution::AwaitingFeedback | CycleResolution::NothingDetected => {
                    inner.stats.cycles_succeeded += 1;
                }
            }
        }
        Err(e) => {
            let message = e.to_string();
            if inner.machine.fail(&ticket, &message) {
                inner.stats.cycles_failed += 1;
                shared.emit(EngineEvent::CycleFailed {
                    detection_id: ticket.id,
                    message,
                });
            }
        }
    }

    shared.commit(&inner, before);
}

/// Save a high-confidence result once the dwell has elapsed
async fn auto_save_after_dwell(shared: Arc<Shared>, detection_id: u64, token: CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {
            debug!("Auto-save for detection {} cancelled", detection_id);
            return;
        }
        _ = tokio::time::sleep(Duration::from_millis(AUTO_SAVE_DWELL_MS)) => {}
    }

    let mut inner = shared.inner.write().await;
    let before = inner.machine.state();
    if let Some(result) = inner.machine.finish_auto_save(detection_id) {
        info!("Detection {} auto-saved", detection_id);
        inner.stats.auto_saves += 1;
        shared.emit(EngineEvent::AutoSaved { result });
        shared.commit(&inner, before);
    }
}

async fn polling_loop(shared: Arc<Shared>, token: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_millis(shared.config.tick_interval_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!("Polling loop started ({} ms)", shared.config.tick_interval_ms);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = interval.tick() => shared.tick(&token).await,
        }
    }

    debug!("Polling loop stopped");
}

struct RunHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Real-time multimodal detection engine
pub struct DetectionEngine {
    shared: Arc<Shared>,
    media: MediaSourceManager,
    event_rx: Arc<RwLock<mpsc::Receiver<EngineEvent>>>,
    running: Mutex<Option<RunHandle>>,
}

impl DetectionEngine {
    /// Create an engine over a media backend and inference client
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn MediaBackend>,
        client: Arc<dyn InferenceClient>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        info!("Initializing detection engine");
        info!("Inference endpoint: {}", config.predict_url());
        info!("Tick interval: {} ms", config.tick_interval_ms);

        let threshold = ThresholdCell::new(config.initial_threshold);
        let inner = EngineInner::new();
        let (snapshot_tx, _) = watch::channel(inner.snapshot(threshold.get()));
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                client,
                threshold,
                inner: RwLock::new(inner),
                in_flight: AtomicBool::new(false),
                event_tx,
                snapshot_tx,
            }),
            media: MediaSourceManager::new(backend),
            event_rx: Arc::new(RwLock::new(event_rx)),
            running: Mutex::new(None),
        })
    }

    /// Create an engine talking to the HTTP inference service in `config`
    pub fn with_http_client(
        config: EngineConfig,
        backend: Arc<dyn MediaBackend>,
    ) -> Result<Self, EngineError> {
        let client = HttpInferenceClient::from_config(&config)?;
        Self::new(config, backend, Arc::new(client))
    }

    /// Acquire media and start the polling loop
    ///
    /// Acquisition failures are terminal for this attempt and are also shown
    /// on the surface as `camera_error`.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!("Engine already running");
            return Ok(());
        }

        let session = match self.media.start() {
            Ok(session) => session,
            Err(e) => {
                error!("Media acquisition failed: {}", e);
                let mut inner = self.shared.inner.write().await;
                let before = inner.machine.state();
                inner.camera_error = Some(e.to_string());
                self.shared.commit(&inner, before);
                return Err(e.into());
            }
        };

        let analyzer = match session.attach_audio_tap() {
            Ok(tap) => RollingAudioAnalyzer::new(tap),
            Err(e) => {
                warn!("{}; continuing in visual-only mode", e);
                RollingAudioAnalyzer::visual_only()
            }
        };

        {
            let mut inner = self.shared.inner.write().await;
            let before = inner.machine.state();
            inner.machine.reset_session();
            inner.policy.reset();
            inner.analyzer = Some(analyzer);
            inner.session = Some(session);
            inner.camera_error = None;
            inner.loudness = 0.0;
            inner.is_running = true;
            inner.stats.is_running = true;
            self.shared.commit(&inner, before);
        }

        let token = CancellationToken::new();
        let task = tokio::spawn(polling_loop(self.shared.clone(), token.clone()));
        *running = Some(RunHandle { token, task });

        info!("Detection engine started");
        Ok(())
    }

    /// Stop the polling loop, close the audio node, and release media
    pub async fn stop(&self) -> Result<(), EngineError> {
        let Some(handle) = self.running.lock().await.take() else {
            warn!("Engine not running");
            return Ok(());
        };

        handle.token.cancel();
        if let Err(e) = handle.task.await {
            error!("Polling loop ended abnormally: {}", e);
        }

        let session = {
            let mut inner = self.shared.inner.write().await;
            inner.analyzer = None;
            inner.session.take()
        };

        // Track threads are joined here; keep that off the runtime and the state lock
        if let Some(session) = session {
            let released = tokio::task::spawn_blocking(move || {
                session.detach_audio_tap();
                session.release();
            })
            .await;
            if let Err(e) = released {
                error!("Media release task failed: {}", e);
            }
        }
        self.media.stop();

        let mut inner = self.shared.inner.write().await;
        let before = inner.machine.state();
        inner.machine.reset_session();
        inner.policy.reset();
        inner.loudness = 0.0;
        inner.is_running = false;
        inner.stats.is_running = false;
        self.shared.commit(&inner, before);

        info!("Detection engine stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Resolve a displayed result; no-op while detecting or with nothing shown
    async fn resolve(&self, toast: &str, count: fn(&mut EngineStats)) -> Option<DetectionResult> {
        let mut inner = self.shared.inner.write().await;
        let before = inner.machine.state();
        if before == EngineState::Detecting || inner.machine.result().is_none() {
            return None;
        }

        let resolved = inner.machine.reset(Some(toast));
        count(&mut inner.stats);
        self.shared.commit(&inner, before);
        resolved
    }

    /// Accept the current result as-is
    pub async fn confirm(&self) -> Option<DetectionResult> {
        let result = self
            .resolve("Data saved!", |stats| stats.confirmations += 1)
            .await?;
        info!("Detection confirmed");
        self.shared.emit(EngineEvent::Confirmed {
            result: result.clone(),
        });
        Some(result)
    }

    /// Save the current result under a corrected label
    pub async fn correct(&self, label: &str) -> Option<DetectionResult> {
        let result = self
            .resolve("Correction saved!", |stats| stats.corrections += 1)
            .await?;
        info!("Detection corrected to '{}'", label);
        self.shared.emit(EngineEvent::Corrected {
            result: result.clone(),
            label: label.to_string(),
        });
        Some(result)
    }

    /// Discard the current result and re-arm triggering
    pub async fn reset(&self) {
        let mut inner = self.shared.inner.write().await;
        let before = inner.machine.state();
        inner.machine.reset(None);
        self.shared.commit(&inner, before);
        debug!("Detection reset");
    }

    pub async fn dismiss_toast(&self) {
        let mut inner = self.shared.inner.write().await;
        let before = inner.machine.state();
        inner.machine.dismiss_toast();
        self.shared.commit(&inner, before);
    }

    /// Override the base threshold; returns the clamped value applied
    pub fn set_threshold(&self, value: f32) -> f32 {
        let applied = self.shared.threshold.set(value);
        info!("Base threshold set to {:.2}", applied);
        applied
    }

    pub fn threshold(&self) -> f32 {
        self.shared.threshold.get()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let inner = self.shared.inner.read().await;
        inner.snapshot(self.shared.threshold.get())
    }

    /// Receiver updated whenever the snapshot changes
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    /// Get the next engine event (non-blocking)
    pub async fn try_recv_event(&self) -> Option<EngineEvent> {
        let mut rx = self.event_rx.write().await;
        rx.try_recv().ok()
    }

    /// Get the next engine event (blocking)
    pub async fn recv_event(&self) -> Option<EngineEvent> {
        let mut rx = self.event_rx.write().await;
        rx.recv().await
    }

    pub async fn stats(&self) -> EngineStats {
        self.shared.inner.read().await.stats.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }
}

impl Drop for DetectionEngine {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.try_lock() {
            if let Some(handle) = running.take() {
                handle.token.cancel();
            }
        }
    }
}
