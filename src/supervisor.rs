//! Connection supervisor.
//!
//! Owns the single device session: scans for the band, connects, discovers
//! services and hands out characteristic subscriptions. Every phase is bounded
//! by a cancellable timer and can be aborted through a [`CancellationToken`].

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::{
    classify, AdapterError, BleAdapter, ClassifiedCandidate, NotificationStream, PeripheralId,
    ScanFilter,
};
use crate::config::SupervisorConfig;
use crate::data::{
    CharacteristicKind, CharacteristicSample, ConnectionSession, FailureReason, SampleValue,
    StepSource, SupervisorState,
};
use crate::error::{Error, Result};
use crate::host::{MetricKind, NullSink, TelemetryRecord, TelemetrySink};
use crate::radio::RadioGuard;
use crate::scheduler::{Scheduler, TimerOutcome, TokioScheduler};
use crate::sync::DeviceStepSource;
use crate::utils::{Clock, SystemClock};

/// Result of a session attempt that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The band is connected and monitoring.
    Connected(ConnectionSession),
    /// No band advertised within the scan window.
    NotFound,
}

impl ConnectOutcome {
    /// Check if the band was found and connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

/// Outcome of one adapter call raced against its timeout and cancellation.
enum Step<T> {
    Done(T),
    Failed(AdapterError),
    TimedOut,
    Cancelled,
}

/// Why a single scan→connect attempt stopped short.
enum AttemptError {
    Failed(FailureReason),
    Cancelled,
}

struct SubscriptionEntry {
    id: u64,
    peripheral: PeripheralId,
    characteristic: Uuid,
    token: CancellationToken,
    released: AtomicBool,
}

struct Inner {
    adapter: Arc<dyn BleAdapter>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn TelemetrySink>,
    user_id: String,
    config: SupervisorConfig,
    guard: RadioGuard,
    session: RwLock<Option<ConnectionSession>>,
    /// Set while a `connect` call owns the session.
    connecting: AtomicBool,
    /// Cancels the in-flight attempt on `disconnect`/`shutdown`.
    attempt: Mutex<Option<CancellationToken>>,
    subscriptions: Mutex<Vec<Arc<SubscriptionEntry>>>,
    next_subscription: AtomicU64,
    state_tx: broadcast::Sender<SupervisorState>,
}

/// Releases the connect claim when the attempt ends, however it ends.
struct ConnectClaim {
    inner: Arc<Inner>,
}

impl Drop for ConnectClaim {
    fn drop(&mut self) {
        self.inner.attempt.lock().take();
        self.inner.connecting.store(false, Ordering::SeqCst);
    }
}

/// Builder for [`ConnectionSupervisor`].
pub struct SupervisorBuilder {
    adapter: Arc<dyn BleAdapter>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn TelemetrySink>,
    user_id: String,
    config: SupervisorConfig,
}

impl SupervisorBuilder {
    /// Use custom settings.
    pub fn config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom timer source.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Use a custom clock for sample timestamps.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Forward samples to `sink` on behalf of `user_id`.
    pub fn telemetry(mut self, sink: Arc<dyn TelemetrySink>, user_id: impl Into<String>) -> Self {
        self.sink = sink;
        self.user_id = user_id.into();
        self
    }

    /// Build the supervisor.
    pub fn build(self) -> ConnectionSupervisor {
        let (state_tx, _) = broadcast::channel(16);
        let guard = RadioGuard::new(
            self.adapter.clone(),
            self.scheduler.clone(),
            self.config.radio_recheck_delay,
        );

        ConnectionSupervisor {
            inner: Arc::new(Inner {
                adapter: self.adapter,
                scheduler: self.scheduler,
                clock: self.clock,
                sink: self.sink,
                user_id: self.user_id,
                config: self.config,
                guard,
                session: RwLock::new(None),
                connecting: AtomicBool::new(false),
                attempt: Mutex::new(None),
                subscriptions: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                state_tx,
            }),
        }
    }
}

/// Supervises the single band session.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
}

impl ConnectionSupervisor {
    /// Create a supervisor with default timers, clock and no telemetry.
    pub fn new(adapter: Arc<dyn BleAdapter>, config: SupervisorConfig) -> Self {
        Self::builder(adapter).config(config).build()
    }

    /// Start building a supervisor around `adapter`.
    pub fn builder(adapter: Arc<dyn BleAdapter>) -> SupervisorBuilder {
        SupervisorBuilder {
            adapter,
            scheduler: Arc::new(TokioScheduler),
            clock: Arc::new(SystemClock),
            sink: Arc::new(NullSink),
            user_id: String::new(),
            config: SupervisorConfig::default(),
        }
    }

    /// Settings in use.
    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Current state.
    pub fn state(&self) -> SupervisorState {
        self.inner
            .session
            .read()
            .as_ref()
            .map(|s| s.state)
            .unwrap_or_default()
    }

    /// Snapshot of the current or last session.
    pub fn session(&self) -> Option<ConnectionSession> {
        self.inner.session.read().clone()
    }

    /// Subscribe to state changes.
    pub fn subscribe_state(&self) -> broadcast::Receiver<SupervisorState> {
        self.inner.state_tx.subscribe()
    }

    /// Check if samples can flow.
    pub fn is_monitoring(&self) -> bool {
        self.state().is_monitoring()
    }

    /// Find, connect and start monitoring the band.
    ///
    /// `known` is the band seen during the last successful sync; it matches
    /// ahead of every other classification rule. Returns
    /// [`ConnectOutcome::NotFound`] when the scan window closes without a
    /// match. Connection and discovery failures are retried per the backoff
    /// policy, each retry with a wider scan window.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] if the configuration cannot drive a
    ///   session.
    /// - [`Error::PermissionDenied`], [`Error::RadioOff`],
    ///   [`Error::RadioStateUnknown`] if the radio is not usable.
    /// - [`Error::SessionActive`] if another session is in progress.
    /// - [`Error::Cancelled`] if `cancel` fired or the session was torn down.
    /// - [`Error::ScanFailed`], [`Error::ConnectionFailed`] or
    ///   [`Error::ServiceDiscoveryFailed`] once retries are exhausted.
    pub async fn connect(
        &self,
        known: Option<&PeripheralId>,
        cancel: &CancellationToken,
    ) -> Result<ConnectOutcome> {
        self.inner.config.validate()?;
        self.inner.guard.check_ready().await.into_result()?;

        let token = cancel.child_token();
        let _claim = self.claim(token.clone())?;

        let mut retry = 0;
        loop {
            match self.attempt(known, retry, &token).await {
                Ok(true) => {
                    let session = self.session().unwrap_or_default();
                    return Ok(ConnectOutcome::Connected(session));
                }
                Ok(false) => return Ok(ConnectOutcome::NotFound),
                Err(AttemptError::Cancelled) => return Err(Error::Cancelled),
                Err(AttemptError::Failed(reason)) => {
                    retry += 1;
                    self.update_session(|s| s.retry_count = retry);

                    let delay = reason
                        .is_retryable()
                        .then(|| self.inner.config.backoff.delay_before(retry))
                        .flatten();
                    let Some(delay) = delay else {
                        warn!("Giving up after {} attempt(s): {}", retry, reason);
                        return Err(failure_error(reason, retry));
                    };

                    info!("Attempt {} failed ({}), retrying in {:?}", retry, reason, delay);
                    let wait = self.inner.scheduler.after(delay).with_parent(&token);
                    if wait.wait().await == TimerOutcome::Cancelled {
                        self.transition(SupervisorState::Idle);
                        return Err(Error::Cancelled);
                    }
                    self.transition(SupervisorState::Scanning);
                }
            }
        }
    }

    /// Claim the single session slot.
    fn claim(&self, token: CancellationToken) -> Result<ConnectClaim> {
        if self
            .inner
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Rejecting connect: an attempt is in flight");
            return Err(Error::SessionActive);
        }
        let claim = ConnectClaim {
            inner: self.inner.clone(),
        };

        {
            let mut session = self.inner.session.write();
            if session.as_ref().map(|s| s.is_active()).unwrap_or(false) {
                debug!("Rejecting connect: a session is active");
                return Err(Error::SessionActive);
            }
            *session = Some(ConnectionSession::new());
        }
        *self.inner.attempt.lock() = Some(token);

        info!("Supervisor: starting session");
        let _ = self.inner.state_tx.send(SupervisorState::Scanning);
        Ok(claim)
    }

    /// One scan→connect→discover pass. `Ok(false)` means the scan timed out.
    async fn attempt(
        &self,
        known: Option<&PeripheralId>,
        retry: u32,
        token: &CancellationToken,
    ) -> std::result::Result<bool, AttemptError> {
        let candidate = match self.scan(known, retry, token).await? {
            Some(candidate) => candidate,
            None => return Ok(false),
        };
        let id = candidate.peripheral.id.clone();

        self.update_session(|s| {
            s.peripheral_id = Some(id.clone());
            s.match_reasons = candidate.reasons.clone();
        });
        self.transition(SupervisorState::CandidateFound);

        if token.is_cancelled() {
            self.transition(SupervisorState::Idle);
            return Err(AttemptError::Cancelled);
        }

        self.transition(SupervisorState::Connecting);
        let connected = self
            .race(
                self.inner.adapter.connect(&id),
                self.inner.config.connect_timeout,
                token,
            )
            .await;
        self.settle(&id, connected, FailureReason::ConnectionFailed)
            .await?;

        self.transition(SupervisorState::ServiceDiscovery);
        let discovered = self
            .race(
                self.inner.adapter.discover_services(&id),
                self.inner.config.discovery_timeout,
                token,
            )
            .await;
        let services = self
            .settle(&id, discovered, FailureReason::ServiceDiscoveryFailed)
            .await?;

        let now = self.inner.clock.now();
        self.update_session(|s| {
            s.services = services;
            s.connected_at = Some(now);
        });
        self.transition(SupervisorState::Monitoring);
        info!("Monitoring {}", id);
        Ok(true)
    }

    /// Scan until the first match, the window closing, or cancellation.
    async fn scan(
        &self,
        known: Option<&PeripheralId>,
        retry: u32,
        token: &CancellationToken,
    ) -> std::result::Result<Option<ClassifiedCandidate>, AttemptError> {
        let adapter = &self.inner.adapter;
        let window = self.inner.config.scan_window(retry);

        let mut stream = match adapter.start_scan(ScanFilter::default()).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to start scan: {}", e);
                self.fail(FailureReason::ScanFailed);
                return Err(AttemptError::Failed(FailureReason::ScanFailed));
            }
        };
        debug!("Scanning for up to {:?}", window);

        let deadline = self.inner.scheduler.after(window).with_parent(token).wait();
        tokio::pin!(deadline);

        let ended = loop {
            tokio::select! {
                outcome = &mut deadline => break Some(outcome),
                next = stream.next() => match next {
                    Some(peripheral) => {
                        let candidate = classify(&peripheral, known, &self.inner.config.classifier);
                        if candidate.is_match {
                            info!(
                                "Found band {} ({:?}): {}",
                                candidate.peripheral.id,
                                candidate.peripheral.name,
                                candidate
                                    .primary_reason()
                                    .map(|r| r.describe())
                                    .unwrap_or_default()
                            );
                            self.stop_scan().await;
                            return Ok(Some(candidate));
                        }
                        trace!("Ignoring {}", peripheral.id);
                    }
                    None => break None,
                },
            }
        };

        self.stop_scan().await;
        match ended {
            Some(TimerOutcome::Elapsed) => {
                info!("No band found within {:?}", window);
                self.fail(FailureReason::ScanTimeout);
                Ok(None)
            }
            Some(TimerOutcome::Cancelled) => {
                info!("Scan cancelled");
                self.transition(SupervisorState::Idle);
                Err(AttemptError::Cancelled)
            }
            None => {
                warn!("Scan stream ended unexpectedly");
                self.fail(FailureReason::ScanFailed);
                Err(AttemptError::Failed(FailureReason::ScanFailed))
            }
        }
    }

    async fn stop_scan(&self) {
        if let Err(e) = self.inner.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
    }

    /// Race an adapter call against its timeout and cancellation.
    async fn race<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, AdapterError>>,
        limit: Duration,
        token: &CancellationToken,
    ) -> Step<T> {
        let deadline = self.inner.scheduler.after(limit).with_parent(token).wait();
        tokio::select! {
            biased;
            result = call => match result {
                Ok(value) => Step::Done(value),
                Err(e) => Step::Failed(e),
            },
            outcome = deadline => match outcome {
                TimerOutcome::Elapsed => Step::TimedOut,
                TimerOutcome::Cancelled => Step::Cancelled,
            },
        }
    }

    /// Map a connected-phase step to the attempt result, releasing the link
    /// on anything but success.
    async fn settle<T>(
        &self,
        id: &PeripheralId,
        step: Step<T>,
        reason: FailureReason,
    ) -> std::result::Result<T, AttemptError> {
        match step {
            Step::Done(value) => Ok(value),
            Step::Cancelled => {
                info!("Cancelled while {}", self.state());
                self.release_link(id).await;
                self.transition(SupervisorState::Disconnected);
                Err(AttemptError::Cancelled)
            }
            Step::TimedOut => {
                warn!("{} timed out for {}", self.state(), id);
                self.release_link(id).await;
                self.fail(reason);
                Err(AttemptError::Failed(reason))
            }
            Step::Failed(e) => {
                warn!("{} failed for {}: {}", self.state(), id, e);
                self.release_link(id).await;
                self.fail(reason);
                Err(AttemptError::Failed(reason))
            }
        }
    }

    async fn release_link(&self, id: &PeripheralId) {
        if let Err(e) = self.inner.adapter.disconnect(id).await {
            debug!("Releasing {} failed: {}", id, e);
        }
    }

    /// Subscribe to a characteristic of the connected band.
    ///
    /// Each notification is decoded into a [`CharacteristicSample`];
    /// malformed payloads arrive as [`SampleValue::Undecodable`] samples and
    /// do not end the stream. Dropping the returned handle unsubscribes.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] if the supervisor is not monitoring.
    /// - [`Error::CharacteristicReadFailed`] if the subscription is refused.
    pub async fn monitor(&self, kind: CharacteristicKind) -> Result<SampleSubscription> {
        let id = self.monitored_peripheral()?;
        let characteristic = kind.uuid();

        let notifications = self
            .inner
            .adapter
            .subscribe_characteristic(&id, characteristic)
            .await
            .map_err(|e| {
                warn!("Subscribe to {} failed: {}", kind, e);
                Error::CharacteristicReadFailed {
                    characteristic: kind.to_string(),
                }
            })?;

        let entry = Arc::new(SubscriptionEntry {
            id: self.inner.next_subscription.fetch_add(1, Ordering::SeqCst),
            peripheral: id,
            characteristic,
            token: CancellationToken::new(),
            released: AtomicBool::new(false),
        });
        self.inner.subscriptions.lock().push(entry.clone());

        let (tx, rx) = mpsc::channel(self.inner.config.notification_buffer.max(1));
        let token = entry.token.clone();
        tokio::spawn(self.clone().forward(kind, notifications, tx, entry));

        debug!("Monitoring {}", kind);
        Ok(SampleSubscription {
            kind,
            receiver: rx,
            token,
        })
    }

    /// Decode notifications into the subscriber's channel until cancelled or
    /// the link drops.
    async fn forward(
        self,
        kind: CharacteristicKind,
        mut notifications: NotificationStream,
        tx: mpsc::Sender<CharacteristicSample>,
        entry: Arc<SubscriptionEntry>,
    ) {
        let layout = self.inner.config.step_layout;
        let link_lost = loop {
            tokio::select! {
                biased;
                _ = entry.token.cancelled() => break false,
                item = notifications.next() => match item {
                    Some(bytes) => {
                        trace!("{} notification: {:02X?}", kind, bytes);
                        let sample =
                            CharacteristicSample::decode(kind, bytes, &layout, self.inner.clock.now());
                        if let SampleValue::Undecodable(failure) = &sample.value {
                            warn!("Undecodable {} sample: {}", kind, failure);
                        }
                        self.publish(&sample);

                        match tx.try_send(sample) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                debug!("{} subscriber lagging, dropping sample", kind);
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break false,
                        }
                    }
                    None => break true,
                },
            }
        };

        drop(notifications);
        let cancelled = entry.token.is_cancelled();
        self.release(&entry).await;

        if link_lost && !cancelled {
            warn!("{} stream ended, link lost", kind);
            self.handle_link_loss().await;
        }
    }

    /// Unsubscribe `entry` exactly once.
    async fn release(&self, entry: &SubscriptionEntry) {
        if entry.released.swap(true, Ordering::SeqCst) {
            return;
        }
        entry.token.cancel();
        self.inner
            .subscriptions
            .lock()
            .retain(|other| other.id != entry.id);

        if let Err(e) = self
            .inner
            .adapter
            .unsubscribe_characteristic(&entry.peripheral, entry.characteristic)
            .await
        {
            debug!("Unsubscribe from {} failed: {}", entry.characteristic, e);
        }
    }

    async fn release_all(&self) {
        let entries: Vec<_> = self.inner.subscriptions.lock().clone();
        for entry in entries {
            self.release(&entry).await;
        }
    }

    /// Read a characteristic once, retrying per the backoff policy.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] if the supervisor is not monitoring.
    /// - [`Error::Cancelled`] if `cancel` fired.
    /// - [`Error::CharacteristicReadFailed`] once retries are exhausted.
    pub async fn read_characteristic(
        &self,
        kind: CharacteristicKind,
        cancel: &CancellationToken,
    ) -> Result<CharacteristicSample> {
        let id = self.monitored_peripheral()?;
        let config = &self.inner.config;

        let mut retry = 0;
        loop {
            let step = self
                .race(
                    self.inner.adapter.read_characteristic(&id, kind.uuid()),
                    config.read_timeout,
                    cancel,
                )
                .await;

            match step {
                Step::Done(bytes) => {
                    let sample = CharacteristicSample::decode(
                        kind,
                        bytes,
                        &config.step_layout,
                        self.inner.clock.now(),
                    );
                    self.publish(&sample);
                    return Ok(sample);
                }
                Step::Cancelled => return Err(Error::Cancelled),
                Step::TimedOut => debug!("Read of {} timed out", kind),
                Step::Failed(e) => debug!("Read of {} failed: {}", kind, e),
            }

            retry += 1;
            let Some(delay) = config.backoff.delay_before(retry) else {
                warn!("Read of {} failed after {} attempt(s)", kind, retry);
                return Err(Error::CharacteristicReadFailed {
                    characteristic: kind.to_string(),
                });
            };
            let wait = self.inner.scheduler.after(delay).with_parent(cancel);
            if wait.wait().await == TimerOutcome::Cancelled {
                return Err(Error::Cancelled);
            }
        }
    }

    /// Tear the session down.
    ///
    /// Releases every subscription before the link. An in-flight `connect`,
    /// including one waiting out a retry delay, is cancelled instead. A no-op
    /// when there is no live session.
    pub async fn disconnect(&self) -> Result<()> {
        let state = self.state();
        if !state.is_monitoring() {
            let attempt = self.inner.attempt.lock().clone();
            match attempt {
                Some(token) => {
                    info!("Cancelling session attempt in {}", state);
                    token.cancel();
                }
                None => debug!("Disconnect in {}: nothing to do", state),
            }
            return Ok(());
        }

        self.release_all().await;
        if let Some(id) = self.peripheral_id() {
            self.release_link(&id).await;
        }
        self.transition(SupervisorState::Disconnected);
        Ok(())
    }

    /// React to the platform reporting that the band went away.
    pub async fn handle_link_loss(&self) {
        if !self.state().is_monitoring() {
            return;
        }
        warn!("Link to {:?} lost", self.peripheral_id());

        self.release_all().await;
        if let Some(id) = self.peripheral_id() {
            self.release_link(&id).await;
        }
        self.transition(SupervisorState::Disconnected);
    }

    /// Cancel any attempt and tear the session down.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down supervisor");
        if let Some(token) = self.inner.attempt.lock().as_ref() {
            token.cancel();
        }
        self.disconnect().await
    }

    fn peripheral_id(&self) -> Option<PeripheralId> {
        self.inner
            .session
            .read()
            .as_ref()
            .and_then(|s| s.peripheral_id.clone())
    }

    fn monitored_peripheral(&self) -> Result<PeripheralId> {
        let session = self.inner.session.read();
        match session.as_ref() {
            Some(s) if s.state.is_monitoring() => s.peripheral_id.clone().ok_or(Error::NotConnected),
            _ => Err(Error::NotConnected),
        }
    }

    fn update_session(&self, f: impl FnOnce(&mut ConnectionSession)) {
        if let Some(session) = self.inner.session.write().as_mut() {
            f(session);
        }
    }

    fn fail(&self, reason: FailureReason) {
        self.update_session(|s| s.last_error = Some(reason));
        self.transition(SupervisorState::Failed(reason));
    }

    fn transition(&self, next: SupervisorState) {
        let previous = {
            let mut session = self.inner.session.write();
            let previous = session.as_ref().map(|s| s.state).unwrap_or_default();
            if previous == next {
                return;
            }
            if !previous.can_transition_to(next) {
                warn!("Unexpected transition {} -> {}", previous, next);
            }

            match next {
                SupervisorState::Idle => *session = None,
                _ => session.get_or_insert_with(ConnectionSession::new).state = next,
            }
            previous
        };

        info!("Supervisor: {} -> {}", previous, next);
        let _ = self.inner.state_tx.send(next);
    }

    fn publish(&self, sample: &CharacteristicSample) {
        if !self.inner.config.forward_samples {
            return;
        }
        let (metric, value) = match &sample.value {
            SampleValue::HeartRate(m) => (MetricKind::HeartRate, m.bpm as f64),
            SampleValue::Steps(steps) => (MetricKind::Steps, *steps as f64),
            _ => return,
        };
        self.inner.sink.push(TelemetryRecord::new(
            self.inner.user_id.clone(),
            sample.timestamp,
            metric,
            value,
            StepSource::Device,
        ));
    }
}

#[async_trait]
impl DeviceStepSource for ConnectionSupervisor {
    fn device_id(&self) -> Option<PeripheralId> {
        self.monitored_peripheral().ok()
    }

    async fn daily_step_count(
        &self,
        date: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<Option<u32>> {
        self.monitored_peripheral()?;
        // The band only exposes the running total of the current day.
        if date != self.inner.clock.today() {
            return Ok(None);
        }

        let sample = self
            .read_characteristic(CharacteristicKind::StepCount, cancel)
            .await?;
        match sample.value {
            SampleValue::Steps(steps) => Ok(Some(steps)),
            SampleValue::Undecodable(failure) => Err(Error::Undecodable(failure)),
            _ => Ok(None),
        }
    }
}

fn failure_error(reason: FailureReason, attempts: u32) -> Error {
    match reason {
        FailureReason::ScanFailed | FailureReason::ScanTimeout => Error::ScanFailed { attempts },
        FailureReason::ConnectionFailed => Error::ConnectionFailed { attempts },
        FailureReason::ServiceDiscoveryFailed => Error::ServiceDiscoveryFailed { attempts },
    }
}

/// Live subscription to one characteristic.
///
/// Yields samples until cancelled or the link drops. Cancelling is
/// idempotent and also happens on drop.
pub struct SampleSubscription {
    kind: CharacteristicKind,
    receiver: mpsc::Receiver<CharacteristicSample>,
    token: CancellationToken,
}

impl SampleSubscription {
    /// Characteristic this subscription follows.
    pub fn kind(&self) -> CharacteristicKind {
        self.kind
    }

    /// Wait for the next sample. `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<CharacteristicSample> {
        self.receiver.recv().await
    }

    /// Stop the subscription.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Check if the subscription was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Stream for SampleSubscription {
    type Item = CharacteristicSample;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl Drop for SampleSubscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for SampleSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleSubscription")
            .field("kind", &self.kind)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{
        DiscoveredPeripheral, MatchReason, MockBleAdapter, RadioState, HEART_RATE_MEASUREMENT_UUID,
        STEP_COUNT_UUID,
    };
    use crate::host::MockTelemetrySink;
    use crate::protocol::StepLayout;
    use crate::scheduler::BackoffPolicy;
    use crate::utils::FixedClock;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use tokio::time::Instant;

    fn band() -> DiscoveredPeripheral {
        DiscoveredPeripheral::new("band-1")
            .with_name("Mi Smart Band 8")
            .with_rssi(-60)
    }

    fn supervisor(adapter: &Arc<MockBleAdapter>) -> ConnectionSupervisor {
        ConnectionSupervisor::new(adapter.clone(), SupervisorConfig::default())
    }

    async fn connected() -> (Arc<MockBleAdapter>, ConnectionSupervisor) {
        let adapter = Arc::new(MockBleAdapter::new());
        adapter.add_advertisement(band());
        let supervisor = supervisor(&adapter);
        let outcome = supervisor
            .connect(None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_connected());
        (adapter, supervisor)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_reaches_monitoring() {
        let adapter = Arc::new(MockBleAdapter::new());
        adapter.add_advertisement(DiscoveredPeripheral::new("tv").with_name("Living Room TV"));
        adapter.add_advertisement(band());
        let supervisor = supervisor(&adapter);
        let mut states = supervisor.subscribe_state();

        let outcome = supervisor
            .connect(None, &CancellationToken::new())
            .await
            .unwrap();

        let ConnectOutcome::Connected(session) = outcome else {
            panic!("expected a connection");
        };
        assert_eq!(session.peripheral_id, Some(PeripheralId::new("band-1")));
        assert_eq!(session.state, SupervisorState::Monitoring);
        assert_eq!(session.retry_count, 0);
        assert!(session.connected_at.is_some());
        assert!(matches!(
            session.match_reasons.as_slice(),
            [MatchReason::NameToken(_)]
        ));

        let mut seen = Vec::new();
        while let Ok(state) = states.try_recv() {
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                SupervisorState::Scanning,
                SupervisorState::CandidateFound,
                SupervisorState::Connecting,
                SupervisorState::ServiceDiscovery,
                SupervisorState::Monitoring,
            ]
        );
        assert!(!adapter.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_timeout_is_not_found() {
        let adapter = Arc::new(MockBleAdapter::new());
        adapter.add_advertisement(DiscoveredPeripheral::new("tv").with_name("Living Room TV"));
        let supervisor = supervisor(&adapter);

        let start = Instant::now();
        let outcome = supervisor
            .connect(None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ConnectOutcome::NotFound);
        assert_eq!(
            supervisor.state(),
            SupervisorState::Failed(FailureReason::ScanTimeout)
        );
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(adapter.scan_count(), 1);
        assert!(!adapter.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_known_device_shortcut() {
        let adapter = Arc::new(MockBleAdapter::new());
        adapter.add_advertisement(DiscoveredPeripheral::new("AA:BB"));
        let supervisor = supervisor(&adapter);

        let known = PeripheralId::new("AA:BB");
        let outcome = supervisor
            .connect(Some(&known), &CancellationToken::new())
            .await
            .unwrap();

        let ConnectOutcome::Connected(session) = outcome else {
            panic!("expected a connection");
        };
        assert_eq!(session.match_reasons, vec![MatchReason::PreviouslyBonded]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_is_retried() {
        let adapter = Arc::new(MockBleAdapter::new());
        adapter.add_advertisement(band());
        adapter.fail_connects(1);
        let supervisor = supervisor(&adapter);

        let start = Instant::now();
        let outcome = supervisor
            .connect(None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.is_connected());
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(adapter.scan_count(), 2);
        let session = supervisor.session().unwrap();
        assert_eq!(session.retry_count, 1);
        assert_eq!(session.last_error, Some(FailureReason::ConnectionFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let adapter = Arc::new(MockBleAdapter::new());
        adapter.add_advertisement(band());
        adapter.fail_connects(3);
        let supervisor = supervisor(&adapter);

        let result = supervisor.connect(None, &CancellationToken::new()).await;

        assert_eq!(result, Err(Error::ConnectionFailed { attempts: 3 }));
        assert_eq!(
            supervisor.state(),
            SupervisorState::Failed(FailureReason::ConnectionFailed)
        );
        assert_eq!(adapter.connect_count(), 3);
        assert!(!adapter.is_connected(&PeripheralId::new("band-1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_discovery_failure() {
        let adapter = Arc::new(MockBleAdapter::new());
        adapter.add_advertisement(band());
        adapter.fail_service_discovery(3);
        let config = SupervisorConfig::default().with_backoff(BackoffPolicy::none());
        let supervisor = ConnectionSupervisor::new(adapter.clone(), config);

        let result = supervisor.connect(None, &CancellationToken::new()).await;

        assert_eq!(result, Err(Error::ServiceDiscoveryFailed { attempts: 1 }));
        assert_eq!(adapter.disconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_start_failure_is_retried() {
        let adapter = Arc::new(MockBleAdapter::new());
        adapter.add_advertisement(band());
        adapter.fail_scans(2);
        let supervisor = supervisor(&adapter);

        let outcome = supervisor
            .connect(None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_connected());
        assert_eq!(supervisor.session().unwrap().retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_off_blocks_scan() {
        let adapter = Arc::new(MockBleAdapter::new());
        adapter.set_radio_state(RadioState::PoweredOff);
        let supervisor = supervisor(&adapter);

        let result = supervisor.connect(None, &CancellationToken::new()).await;

        assert_eq!(result, Err(Error::RadioOff));
        assert_eq!(adapter.scan_count(), 0);
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_session_rejected() {
        let (_adapter, supervisor) = connected().await;

        let result = supervisor.connect(None, &CancellationToken::new()).await;
        assert_eq!(result, Err(Error::SessionActive));
        assert_eq!(supervisor.state(), SupervisorState::Monitoring);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connect_rejected() {
        let adapter = Arc::new(MockBleAdapter::new());
        let supervisor = supervisor(&adapter);

        let first = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.connect(None, &CancellationToken::new()).await })
        };
        settle().await;
        assert_eq!(supervisor.state(), SupervisorState::Scanning);

        let second = supervisor.connect(None, &CancellationToken::new()).await;
        assert_eq!(second, Err(Error::SessionActive));

        assert_eq!(first.await.unwrap(), Ok(ConnectOutcome::NotFound));
        assert_eq!(adapter.scan_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_scan() {
        let adapter = Arc::new(MockBleAdapter::new());
        let supervisor = supervisor(&adapter);
        let cancel = CancellationToken::new();

        let task = {
            let supervisor = supervisor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { supervisor.connect(None, &cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), Err(Error::Cancelled));
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert!(!adapter.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_connect() {
        let adapter = Arc::new(MockBleAdapter::new());
        adapter.add_advertisement(band());
        adapter.set_connect_delay(Duration::from_secs(5));
        let supervisor = supervisor(&adapter);
        let cancel = CancellationToken::new();

        let task = {
            let supervisor = supervisor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { supervisor.connect(None, &cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(supervisor.state(), SupervisorState::Connecting);
        cancel.cancel();

        assert_eq!(task.await.unwrap(), Err(Error::Cancelled));
        assert_eq!(supervisor.state(), SupervisorState::Disconnected);
        assert!(!adapter.is_connected(&PeripheralId::new("band-1")));

        // A torn-down session can be replaced.
        adapter.set_connect_delay(Duration::ZERO);
        let outcome = supervisor
            .connect(None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_attempt() {
        let adapter = Arc::new(MockBleAdapter::new());
        let supervisor = supervisor(&adapter);

        let task = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.connect(None, &CancellationToken::new()).await })
        };
        settle().await;
        supervisor.disconnect().await.unwrap();

        assert_eq!(task.await.unwrap(), Err(Error::Cancelled));
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_retry_delay() {
        let adapter = Arc::new(MockBleAdapter::new());
        adapter.add_advertisement(band());
        adapter.fail_connects(1);
        let supervisor = supervisor(&adapter);

        let task = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.connect(None, &CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            supervisor.state(),
            SupervisorState::Failed(FailureReason::ConnectionFailed)
        );
        supervisor.disconnect().await.unwrap();

        assert_eq!(task.await.unwrap(), Err(Error::Cancelled));
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert_eq!(adapter.connect_count(), 1);
        assert!(!adapter.is_connected(&PeripheralId::new("band-1")));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let adapter = Arc::new(MockBleAdapter::new());
        adapter.add_advertisement(band());
        let config = SupervisorConfig::default().with_step_layout(StepLayout::new(0, 0));
        let supervisor = ConnectionSupervisor::new(adapter.clone(), config);

        let result = supervisor.connect(None, &CancellationToken::new()).await;

        assert!(matches!(result, Err(Error::InvalidParameter { .. })));
        assert_eq!(adapter.scan_count(), 0);
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent() {
        let adapter = Arc::new(MockBleAdapter::new());
        let supervisor = supervisor(&adapter);
        supervisor.disconnect().await.unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Idle);

        let (adapter, supervisor) = connected().await;
        let _hr = supervisor.monitor(CharacteristicKind::HeartRate).await.unwrap();
        assert_eq!(adapter.active_subscriptions(), 1);

        tokio_test::assert_ok!(supervisor.disconnect().await);
        tokio_test::assert_ok!(supervisor.disconnect().await);

        assert_eq!(supervisor.state(), SupervisorState::Disconnected);
        assert_eq!(adapter.active_subscriptions(), 0);
        assert_eq!(adapter.unsubscribe_count(), 1);
        assert_eq!(adapter.disconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heart_rate_monitoring() {
        let (adapter, supervisor) = connected().await;
        let mut hr = supervisor.monitor(CharacteristicKind::HeartRate).await.unwrap();

        assert!(adapter.notify(HEART_RATE_MEASUREMENT_UUID, vec![0x00, 0x48]));
        assert!(adapter.notify(HEART_RATE_MEASUREMENT_UUID, vec![0x01, 0x48]));
        assert!(adapter.notify(HEART_RATE_MEASUREMENT_UUID, vec![0x00, 0x4B]));

        assert_eq!(hr.next().await.and_then(|s| s.heart_rate()), Some(72));
        assert!(hr.next().await.map(|s| s.is_undecodable()).unwrap_or(false));
        assert_eq!(hr.next().await.and_then(|s| s.heart_rate()), Some(75));
        assert_eq!(supervisor.state(), SupervisorState::Monitoring);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_subscription_unsubscribes() {
        let (adapter, supervisor) = connected().await;
        let hr = supervisor.monitor(CharacteristicKind::HeartRate).await.unwrap();
        hr.cancel();
        hr.cancel();
        drop(hr);
        settle().await;

        assert_eq!(adapter.active_subscriptions(), 0);
        assert_eq!(adapter.unsubscribe_count(), 1);
        assert_eq!(supervisor.state(), SupervisorState::Monitoring);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_ends_session() {
        let (adapter, supervisor) = connected().await;
        let mut hr = supervisor.monitor(CharacteristicKind::HeartRate).await.unwrap();

        adapter.drop_link();
        assert_eq!(hr.next().await, None);
        settle().await;

        assert_eq!(supervisor.state(), SupervisorState::Disconnected);
        assert!(supervisor.disconnect().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_requires_session() {
        let adapter = Arc::new(MockBleAdapter::new());
        let result = supervisor(&adapter)
            .monitor(CharacteristicKind::HeartRate)
            .await;
        assert_eq!(result.unwrap_err(), Error::NotConnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_is_retried() {
        let (adapter, supervisor) = connected().await;
        adapter.set_read_value(STEP_COUNT_UUID, vec![0x0C, 0x10, 0x27, 0x00, 0x00]);
        adapter.fail_reads(2);

        let sample = supervisor
            .read_characteristic(CharacteristicKind::StepCount, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(sample.steps(), Some(10_000));

        adapter.fail_reads(3);
        let result = supervisor
            .read_characteristic(CharacteristicKind::StepCount, &CancellationToken::new())
            .await;
        assert_eq!(
            result.unwrap_err(),
            Error::CharacteristicReadFailed {
                characteristic: "step-count".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_step_source() {
        let adapter = Arc::new(MockBleAdapter::new());
        adapter.add_advertisement(band());
        adapter.set_read_value(STEP_COUNT_UUID, vec![0x0C, 0xE8, 0x03, 0x00, 0x00]);
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 3, 7, 12, 0, 0).unwrap(),
        ));
        let supervisor = ConnectionSupervisor::builder(adapter.clone())
            .clock(clock)
            .build();

        let today = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        let cancel = CancellationToken::new();
        assert_eq!(
            supervisor.daily_step_count(today, &cancel).await,
            Err(Error::NotConnected)
        );
        assert_eq!(supervisor.device_id(), None);

        supervisor
            .connect(None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(supervisor.device_id(), Some(PeripheralId::new("band-1")));
        assert_eq!(
            supervisor.daily_step_count(today, &cancel).await,
            Ok(Some(1000))
        );
        assert_eq!(
            supervisor
                .daily_step_count(today.pred_opt().unwrap(), &cancel)
                .await,
            Ok(None)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_read_follows_cancel() {
        let adapter = Arc::new(MockBleAdapter::new());
        adapter.add_advertisement(band());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 3, 7, 12, 0, 0).unwrap(),
        ));
        let supervisor = ConnectionSupervisor::builder(adapter.clone())
            .clock(clock)
            .build();
        supervisor
            .connect(None, &CancellationToken::new())
            .await
            .unwrap();
        adapter.fail_reads(3);

        let cancel = CancellationToken::new();
        let task = {
            let supervisor = supervisor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let today = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
                supervisor.daily_step_count(today, &cancel).await
            })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        let cancelled_at = Instant::now();
        cancel.cancel();

        assert_eq!(task.await.unwrap(), Err(Error::Cancelled));
        assert!(cancelled_at.elapsed() < Duration::from_millis(100));
        assert!(supervisor.is_monitoring());
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_forwarded_to_sink() {
        let adapter = Arc::new(MockBleAdapter::new());
        adapter.add_advertisement(band());
        let mut sink = MockTelemetrySink::new();
        sink.expect_push()
            .withf(|r| {
                r.metric == MetricKind::HeartRate
                    && r.value == 72.0
                    && r.user_id == "user-1"
                    && r.source == StepSource::Device
            })
            .times(1)
            .return_const(());

        let supervisor = ConnectionSupervisor::builder(adapter.clone())
            .telemetry(Arc::new(sink), "user-1")
            .build();
        supervisor
            .connect(None, &CancellationToken::new())
            .await
            .unwrap();

        let mut hr = supervisor.monitor(CharacteristicKind::HeartRate).await.unwrap();
        adapter.notify(HEART_RATE_MEASUREMENT_UUID, vec![0x00, 0x48]);
        assert!(hr.next().await.is_some());
    }
}
