//! The intent engine: single ingress for every trigger.
//!
//! The engine ties the parser, the pending store, the scan locks, one
//! resolution machine per kind, the expiry timers and recovery together, and
//! reports to the view through an [`IntentObserver`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::parser::{classify, invalid_format, Classification, TriggerSource};
use crate::recovery::{IntentReplay, RecoveryCoordinator, RecoveryReport, ReplayOutcome};
use crate::{
    EngineConfig, ErrorKind, ExpiryHandle, ExpiryTimer, ExpiryWindow, IntentBackend, IntentError,
    IntentKind, NotificationPayload, ParsedIntent, PaymentIntent, PaymentOutcome, PendingEntry,
    PendingIntentStore, ResolutionMachine, ResolutionState, ResolvedPaymentRequest,
    ResolvedTransferToken, Result, ScanLocks, ScannerId, SessionProvider, TransferTokenIntent,
};

/// Lifecycle of the active payment request.
pub type PaymentState = ResolutionState<ResolvedPaymentRequest, PaymentOutcome>;
/// Lifecycle of the active transfer token. Transfers have no approval step.
pub type TransferState = ResolutionState<ResolvedTransferToken, ()>;

/// A state change of either machine, as delivered to the view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "state", rename_all = "snake_case")]
pub enum StateUpdate {
    Payment(PaymentState),
    TransferToken(TransferState),
}

impl StateUpdate {
    pub fn kind(&self) -> IntentKind {
        match self {
            Self::Payment(_) => IntentKind::Payment,
            Self::TransferToken(_) => IntentKind::TransferToken,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Payment(state) => state.status(),
            Self::TransferToken(state) => state.status(),
        }
    }

    pub fn is_ready(&self) -> bool {
        match self {
            Self::Payment(state) => state.is_ready(),
            Self::TransferToken(state) => state.is_ready(),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Payment(state) => state.error_kind(),
            Self::TransferToken(state) => state.error_kind(),
        }
    }
}

/// What became of an accepted trigger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TriggerDispatch {
    /// Persisted, waiting for the user to log in. No network call was made.
    LoginRequired(ParsedIntent),
    /// Handed to the resolution machine; carries the state it ended in.
    Resolution(StateUpdate),
}

/// Result of a scan callback.
pub enum ScanDispatch {
    /// The scanner's lock was held; the callback did nothing.
    Busy,
    /// The lock was taken synchronously; drive the future to resolve.
    Accepted(BoxFuture<'static, Result<TriggerDispatch>>),
}

impl std::fmt::Debug for ScanDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Busy => f.write_str("Busy"),
            Self::Accepted(_) => f.write_str("Accepted(..)"),
        }
    }
}

/// Callbacks the view layer renders from. All have no-op defaults.
pub trait IntentObserver: Send + Sync {
    /// A resolution or approval finished, or an intent was closed.
    fn on_resolved(&self, _update: StateUpdate) {}

    /// The validity window of the active intent ran out.
    fn on_expired(&self, _kind: IntentKind) {}

    /// Once per second while a resolved intent is shown.
    fn on_expiry_progress(&self, _kind: IntentKind, _remaining_fraction: f64) {}

    /// A pending entry kept failing transiently during recovery.
    fn on_recovery_exhausted(&self, _kind: IntentKind) {}

    /// The intent is persisted; navigate to login.
    fn on_login_required(&self, _intent: &ParsedIntent) {}

    /// A trigger matched no known format.
    fn on_invalid_trigger(&self, _source: TriggerSource, _input: &str) {}
}

/// Observer that ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl IntentObserver for NoopObserver {}

// ═══════════════════════════════════════════════════════════════════════════════
// ENGINE
// ═══════════════════════════════════════════════════════════════════════════════

/// The payment & transfer intent engine. Cheap to clone.
#[derive(Clone)]
pub struct IntentEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    backend: Arc<dyn IntentBackend>,
    session: Arc<dyn SessionProvider>,
    observer: Arc<dyn IntentObserver>,
    store: PendingIntentStore,
    payments: ResolutionMachine<ResolvedPaymentRequest, PaymentOutcome>,
    transfers: ResolutionMachine<ResolvedTransferToken, ()>,
    scan_locks: ScanLocks,
    /// Scanner whose lock is still held for the active intent of a kind.
    scan_origin: Mutex<HashMap<IntentKind, ScannerId>>,
    timers: Mutex<HashMap<IntentKind, ExpiryHandle>>,
    /// Browser that opened the active payment.
    payment_browser: Mutex<Option<String>>,
    recovery: RecoveryCoordinator,
}

impl IntentEngine {
    /// Build an engine with the pending store `config` describes.
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn IntentBackend>,
        session: Arc<dyn SessionProvider>,
        observer: Arc<dyn IntentObserver>,
    ) -> Result<Self> {
        config.validate()?;
        let store = PendingIntentStore::from_config(&config)?;
        Ok(Self::with_store(config, store, backend, session, observer))
    }

    /// Build an engine over an already opened store.
    pub fn with_store(
        config: EngineConfig,
        store: PendingIntentStore,
        backend: Arc<dyn IntentBackend>,
        session: Arc<dyn SessionProvider>,
        observer: Arc<dyn IntentObserver>,
    ) -> Self {
        let timeout = config.resolve_timeout();
        let recovery = RecoveryCoordinator::new(store.clone(), config.max_recovery_attempts);
        Self {
            inner: Arc::new(EngineInner {
                payments: ResolutionMachine::new(IntentKind::Payment, timeout),
                transfers: ResolutionMachine::new(IntentKind::TransferToken, timeout),
                scan_locks: ScanLocks::default(),
                scan_origin: Mutex::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
                payment_browser: Mutex::new(None),
                recovery,
                config,
                backend,
                session,
                observer,
                store,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &PendingIntentStore {
        &self.inner.store
    }

    pub fn payment_state(&self) -> PaymentState {
        self.inner.payments.state()
    }

    pub fn transfer_state(&self) -> TransferState {
        self.inner.transfers.state()
    }

    pub fn subscribe_payments(&self) -> watch::Receiver<PaymentState> {
        self.inner.payments.subscribe()
    }

    pub fn subscribe_transfers(&self) -> watch::Receiver<TransferState> {
        self.inner.transfers.subscribe()
    }

    pub fn is_scan_locked(&self, scanner: ScannerId) -> bool {
        self.inner.scan_locks.get(scanner).is_held()
    }

    /// Deadline of the expiry timer started for the active intent of `kind`.
    pub fn expiry_deadline(&self, kind: IntentKind) -> Option<DateTime<Utc>> {
        lock(&self.inner.timers)
            .get(&kind)
            .map(ExpiryHandle::expires_at)
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Ingress
    // ───────────────────────────────────────────────────────────────────────────

    /// A URL handed to the app by the OS.
    pub async fn request_deep_link(&self, url: &str) -> Result<TriggerDispatch> {
        let intent = self.classify_or_reject(url, TriggerSource::DeepLink)?;
        self.dispatch(intent).await
    }

    /// A tapped push notification.
    pub async fn request_notification(
        &self,
        payload: &NotificationPayload,
    ) -> Result<TriggerDispatch> {
        let intent = match payload.classify().intent() {
            Some(intent) => intent.clone(),
            None => {
                let described = payload.describe();
                return Err(self.reject(TriggerSource::Notification, &described));
            }
        };
        self.dispatch(intent).await
    }

    /// A camera callback from `scanner`.
    ///
    /// The scanner's lock is taken before this returns, so back-to-back
    /// callbacks for the same frame cannot both start a resolution. The lock
    /// is released when classification fails, when the intent resolves or is
    /// deferred for login, and otherwise by [`IntentEngine::try_again_scan`]
    /// or by closing the intent. Dropping the returned future unpolled leaves
    /// the lock held.
    pub fn request_scan(&self, payload: &str, scanner: ScannerId) -> ScanDispatch {
        if !self.inner.scan_locks.get(scanner).try_acquire() {
            tracing::debug!(?scanner, "scan ignored, scanner busy");
            return ScanDispatch::Busy;
        }

        let engine = self.clone();
        let payload = payload.to_string();
        ScanDispatch::Accepted(Box::pin(async move { engine.run_scan(&payload, scanner).await }))
    }

    /// Release `scanner` after the user chose to scan again.
    pub fn try_again_scan(&self, scanner: ScannerId) -> bool {
        lock(&self.inner.scan_origin).retain(|_, origin| *origin != scanner);
        self.inner.scan_locks.get(scanner).release()
    }

    /// Replay pending intents after app initialization.
    pub async fn on_app_ready(&self) -> Result<RecoveryReport> {
        self.inner.recovery.recover(self).await
    }

    /// Replay pending intents after a successful login.
    pub async fn on_authenticated(&self) -> Result<RecoveryReport> {
        self.inner.recovery.recover(self).await
    }

    // ───────────────────────────────────────────────────────────────────────────
    // User actions
    // ───────────────────────────────────────────────────────────────────────────

    /// Approve the ready payment with `card_id`.
    pub async fn approve_payment(&self, card_id: &str) -> Result<PaymentState> {
        let backend = Arc::clone(&self.inner.backend);
        let source_browser = lock(&self.inner.payment_browser).clone();
        let card_id = card_id.to_string();

        let state = self
            .inner
            .payments
            .approve(move |request| {
                if request.card(&card_id).is_none() {
                    return Err(IntentError::UnknownCard(card_id));
                }
                let request_id = request.request_id.clone();
                let fallback_url = request.return_url.clone();
                Ok(async move {
                    let approval = backend.approve_payment(&request_id, &card_id).await?;
                    Ok(PaymentOutcome {
                        request_id,
                        card_id,
                        return_url: approval.return_url.or(fallback_url),
                        source_browser,
                    })
                })
            })
            .await?;

        match state {
            ResolutionState::Success(ref outcome) => {
                tracing::info!(request_id = %outcome.request_id, "payment approved");
                self.stop_timer(IntentKind::Payment);
                self.clear_pending(IntentKind::Payment, &outcome.request_id);
                self.notify(StateUpdate::Payment(state.clone()));
            }
            ResolutionState::Error(ref err) => {
                if err.kind.is_terminal() {
                    self.stop_timer(IntentKind::Payment);
                }
                if let Some(id) = self.inner.payments.active_id() {
                    if err.kind.clears_pending() {
                        self.clear_pending(IntentKind::Payment, &id);
                    }
                }
                self.notify(StateUpdate::Payment(state.clone()));
            }
            _ => {}
        }
        Ok(state)
    }

    /// Re-resolve the active intent of `kind` after a retryable error.
    pub async fn retry(&self, kind: IntentKind) -> Result<StateUpdate> {
        let intent = match kind {
            IntentKind::Payment => {
                let request_id = self.inner.payments.retry_target()?;
                ParsedIntent::Payment(PaymentIntent {
                    request_id,
                    source_browser: lock(&self.inner.payment_browser).clone(),
                })
            }
            IntentKind::TransferToken => {
                TransferTokenIntent::new(self.inner.transfers.retry_target()?).into()
            }
        };
        Ok(self.resolve_intent(intent).await)
    }

    /// Decline the payment: close it locally, then tell the backend.
    pub async fn cancel_payment(&self) -> Result<()> {
        let Some(request_id) = self.close_local(IntentKind::Payment) else {
            return Ok(());
        };

        let timeout = self.inner.config.resolve_timeout();
        match tokio::time::timeout(timeout, self.inner.backend.cancel_payment(&request_id)).await
        {
            Ok(Ok(())) => {
                tracing::info!(%request_id, "payment cancelled");
                Ok(())
            }
            Ok(Err(err)) => {
                tracing::warn!(%request_id, error = %err, "backend cancel failed");
                Err(err.into())
            }
            Err(_) => {
                tracing::warn!(%request_id, "backend cancel timed out");
                Err(IntentError::Resolution {
                    kind: ErrorKind::Timeout,
                    detail: format!("cancel not acknowledged within {}s", timeout.as_secs()),
                })
            }
        }
    }

    /// Close the payment screen without telling the backend.
    pub fn close_payment(&self) -> Option<String> {
        self.close_local(IntentKind::Payment)
    }

    /// Close the transfer screen.
    pub fn close_transfer(&self) -> Option<String> {
        self.close_local(IntentKind::TransferToken)
    }

    /// The user sent money to the resolved recipient.
    pub fn complete_transfer(&self) -> Result<String> {
        if !self.inner.transfers.state().is_ready() {
            return Err(IntentError::IllegalTransition(
                "complete_transfer is only legal from Ready",
            ));
        }
        self.close_local(IntentKind::TransferToken)
            .ok_or(IntentError::IllegalTransition("no active transfer token"))
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Internals
    // ───────────────────────────────────────────────────────────────────────────

    fn classify_or_reject(&self, input: &str, source: TriggerSource) -> Result<ParsedIntent> {
        match classify(input, source) {
            Classification::Recognized { intent } => Ok(intent),
            Classification::Unrecognized => Err(self.reject(source, input)),
        }
    }

    fn reject(&self, source: TriggerSource, input: &str) -> IntentError {
        tracing::info!(?source, "rejected unrecognized trigger");
        self.inner.observer.on_invalid_trigger(source, input);
        invalid_format(input)
    }

    async fn run_scan(&self, payload: &str, scanner: ScannerId) -> Result<TriggerDispatch> {
        let lock_ref = self.inner.scan_locks.get(scanner);

        let intent = match self.classify_or_reject(payload, TriggerSource::Scan) {
            Ok(intent) if scanner.accepts(intent.kind()) => intent,
            Ok(intent) => {
                lock_ref.release();
                tracing::info!(?scanner, kind = %intent.kind(), "intent not accepted by scanner");
                return Err(self.reject(TriggerSource::Scan, payload));
            }
            Err(err) => {
                lock_ref.release();
                return Err(err);
            }
        };

        let kind = intent.kind();
        let previous = lock(&self.inner.scan_origin).insert(kind, scanner);
        if let Some(previous) = previous.filter(|previous| *previous != scanner) {
            self.inner.scan_locks.get(previous).release();
        }

        let dispatch = self.dispatch(intent).await;
        let keep_lock = matches!(
            dispatch,
            Ok(TriggerDispatch::Resolution(ref update)) if update.error_kind().is_some()
        );
        if !keep_lock {
            lock(&self.inner.scan_origin).remove(&kind);
            lock_ref.release();
        }
        dispatch
    }

    /// Persist, check the session, then resolve.
    async fn dispatch(&self, intent: ParsedIntent) -> Result<TriggerDispatch> {
        self.inner.store.save(&PendingEntry::from(&intent))?;

        if !self.is_authenticated().await {
            tracing::info!(kind = %intent.kind(), id = intent.id(), "login required, intent queued");
            self.inner.observer.on_login_required(&intent);
            return Ok(TriggerDispatch::LoginRequired(intent));
        }

        Ok(TriggerDispatch::Resolution(self.resolve_intent(intent).await))
    }

    async fn is_authenticated(&self) -> bool {
        let timeout = self.inner.config.session_check_timeout();
        match tokio::time::timeout(timeout, self.inner.session.is_authenticated()).await {
            Ok(Ok(authenticated)) => authenticated,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "session check failed, treating as signed out");
                false
            }
            Err(_) => {
                tracing::warn!("session check timed out, treating as signed out");
                false
            }
        }
    }

    async fn resolve_intent(&self, intent: ParsedIntent) -> StateUpdate {
        let kind = intent.kind();
        let id = intent.id().to_string();
        let backend = Arc::clone(&self.inner.backend);

        let update = match intent {
            ParsedIntent::Payment(payment) => {
                let machine = &self.inner.payments;
                if machine.active_id().as_deref() != Some(id.as_str()) {
                    if !matches!(machine.state(), ResolutionState::Approving) {
                        self.stop_timer(kind);
                        *lock(&self.inner.payment_browser) = payment.source_browser;
                    }
                } else if payment.source_browser.is_some() {
                    *lock(&self.inner.payment_browser) = payment.source_browser;
                }

                let request_id = id.clone();
                let state = machine
                    .resolve(&id, move || async move {
                        backend.get_payment_details(&request_id).await
                    })
                    .await;
                if let ResolutionState::Ready(ref request) = state {
                    self.start_timer(kind, request.expires_at);
                }
                StateUpdate::Payment(state)
            }
            ParsedIntent::TransferToken(_) => {
                let machine = &self.inner.transfers;
                if machine.active_id().as_deref() != Some(id.as_str()) {
                    self.stop_timer(kind);
                }

                let token_id = id.clone();
                let state = machine
                    .resolve(&id, move || async move {
                        backend.resolve_transfer_token(&token_id).await
                    })
                    .await;
                if let ResolutionState::Ready(ref token) = state {
                    self.start_timer(kind, token.expires_at);
                }
                StateUpdate::TransferToken(state)
            }
        };

        self.after_resolution(kind, &id, &update);
        update
    }

    fn after_resolution(&self, kind: IntentKind, id: &str, update: &StateUpdate) {
        if self.active_id(kind).as_deref() != Some(id) {
            return;
        }
        if update.is_ready() {
            self.notify(update.clone());
        } else if let Some(error) = update.error_kind() {
            self.stop_timer(kind);
            if error.clears_pending() {
                self.clear_pending(kind, id);
            }
            self.notify(update.clone());
        }
    }

    fn active_id(&self, kind: IntentKind) -> Option<String> {
        match kind {
            IntentKind::Payment => self.inner.payments.active_id(),
            IntentKind::TransferToken => self.inner.transfers.active_id(),
        }
    }

    fn close_local(&self, kind: IntentKind) -> Option<String> {
        let (closed, update) = match kind {
            IntentKind::Payment => {
                *lock(&self.inner.payment_browser) = None;
                (
                    self.inner.payments.reset(),
                    StateUpdate::Payment(ResolutionState::Idle),
                )
            }
            IntentKind::TransferToken => (
                self.inner.transfers.reset(),
                StateUpdate::TransferToken(ResolutionState::Idle),
            ),
        };
        self.stop_timer(kind);

        if let Some(scanner) = lock(&self.inner.scan_origin).remove(&kind) {
            self.inner.scan_locks.get(scanner).release();
        }
        if let Some(ref id) = closed {
            self.clear_pending(kind, id);
            self.notify(update);
        }
        closed
    }

    fn clear_pending(&self, kind: IntentKind, id: &str) {
        if let Err(err) = self.inner.store.clear_if_matches(kind, id) {
            tracing::warn!(%kind, %id, error = %err, "failed to clear pending intent");
        }
    }

    /// Start the expiry timer for `kind`, keeping a running one with the same deadline.
    fn start_timer(&self, kind: IntentKind, expires_at: DateTime<Utc>) {
        let mut timers = lock(&self.inner.timers);
        if timers
            .get(&kind)
            .is_some_and(|handle| handle.expires_at() == expires_at)
        {
            return;
        }

        let window = ExpiryWindow::ending_at(expires_at, self.inner.config.validity(kind));
        let observer = Arc::clone(&self.inner.observer);
        let handle = ExpiryTimer::new(window).spawn(move |tick| {
            observer.on_expiry_progress(kind, tick.fraction);
            if tick.expired {
                tracing::info!(%kind, "intent expired");
                observer.on_expired(kind);
            }
        });
        timers.insert(kind, handle);
    }

    fn stop_timer(&self, kind: IntentKind) {
        lock(&self.inner.timers).remove(&kind);
    }

    fn notify(&self, update: StateUpdate) {
        self.inner.observer.on_resolved(update);
    }
}

impl std::fmt::Debug for IntentEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentEngine")
            .field("store", &self.inner.store)
            .field("payments", &self.inner.payments)
            .field("transfers", &self.inner.transfers)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl IntentReplay for IntentEngine {
    async fn replay(&self, intent: ParsedIntent) -> ReplayOutcome {
        let resolved = match intent.kind() {
            IntentKind::Payment => self.inner.payments.has_result_for(intent.id()),
            IntentKind::TransferToken => self.inner.transfers.has_result_for(intent.id()),
        };
        if resolved {
            return ReplayOutcome::Active;
        }
        let in_flight = match intent.kind() {
            IntentKind::Payment => matches!(
                self.inner.payments.state(),
                ResolutionState::Loading | ResolutionState::Approving
            ),
            IntentKind::TransferToken => self.inner.transfers.state().is_loading(),
        };
        if in_flight {
            return ReplayOutcome::Busy;
        }
        if !self.is_authenticated().await {
            return ReplayOutcome::Deferred;
        }

        let update = self.resolve_intent(intent).await;
        match update.error_kind() {
            Some(kind) => ReplayOutcome::Failed(kind),
            None if update.is_ready() => ReplayOutcome::Resolved,
            None => ReplayOutcome::Busy,
        }
    }

    fn recovery_exhausted(&self, kind: IntentKind) {
        self.inner.observer.on_recovery_exhausted(kind);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
