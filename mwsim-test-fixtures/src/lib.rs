//! Scriptable collaborators and sample payloads shared by the intent engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use mwsim_intents::{
    BackendError, EligibleCard, EngineConfig, IntentBackend, IntentEngine, IntentKind,
    IntentObserver, OrderDetails, OrderLineItem, ParsedIntent, PaymentApproval,
    PendingIntentStore, RecipientKind, ResolvedPaymentRequest, ResolvedTransferToken,
    SessionProvider, StateUpdate, TriggerSource,
};
use tokio::sync::{Notify, Semaphore};

// ═══════════════════════════════════════════════════════════════════════════════
// SAMPLE PAYLOADS
// ═══════════════════════════════════════════════════════════════════════════════

pub const DEFAULT_CARD_ID: &str = "card_visa_4242";
pub const SECOND_CARD_ID: &str = "card_mc_5454";
pub const MERCHANT_RETURN_URL: &str = "https://shop.example.com/checkout/return";

/// A payment request for 42.50 CAD with two eligible cards, valid for five minutes.
pub fn sample_payment_request(request_id: &str) -> ResolvedPaymentRequest {
    sample_payment_request_expiring(request_id, Utc::now() + Duration::seconds(300))
}

pub fn sample_payment_request_expiring(
    request_id: &str,
    expires_at: DateTime<Utc>,
) -> ResolvedPaymentRequest {
    ResolvedPaymentRequest {
        request_id: request_id.to_string(),
        amount_cents: 4_250,
        currency: "CAD".to_string(),
        merchant_id: "merch_coffee".to_string(),
        merchant_name: "Corner Coffee".to_string(),
        merchant_logo_url: None,
        description: Some("Order #1042".to_string()),
        expires_at,
        cards: vec![
            EligibleCard {
                card_id: DEFAULT_CARD_ID.to_string(),
                display_name: "Everyday Visa".to_string(),
                last_four: "4242".to_string(),
                network: "VISA".to_string(),
                is_default: true,
            },
            EligibleCard {
                card_id: SECOND_CARD_ID.to_string(),
                display_name: "Travel Mastercard".to_string(),
                last_four: "5454".to_string(),
                network: "MASTERCARD".to_string(),
                is_default: false,
            },
        ],
        order_details: Some(OrderDetails {
            items: vec![OrderLineItem {
                description: "Flat white".to_string(),
                quantity: 2,
                unit_amount_cents: 2_000,
            }],
            subtotal_cents: Some(4_000),
            tax_cents: Some(250),
            shipping_cents: None,
        }),
        return_url: Some(MERCHANT_RETURN_URL.to_string()),
    }
}

/// An individual recipient token without a fixed amount, valid for five minutes.
pub fn sample_transfer_token(token_id: &str) -> ResolvedTransferToken {
    sample_transfer_token_expiring(token_id, Utc::now() + Duration::seconds(300))
}

pub fn sample_transfer_token_expiring(
    token_id: &str,
    expires_at: DateTime<Utc>,
) -> ResolvedTransferToken {
    ResolvedTransferToken {
        token_id: token_id.to_string(),
        recipient_alias: "@sam".to_string(),
        recipient_display_name: "Sam Rivera".to_string(),
        recipient_bank_name: "BankSim Credit Union".to_string(),
        recipient_kind: RecipientKind::Individual,
        amount_cents: None,
        currency: None,
        note: None,
        expires_at,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MOCK BACKEND
// ═══════════════════════════════════════════════════════════════════════════════

/// A backend call as the mock saw it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendCall {
    GetPaymentDetails(String),
    ApprovePayment { request_id: String, card_id: String },
    CancelPayment(String),
    ResolveTransferToken(String),
}

/// Responses for one id, consumed in order. The last one repeats.
struct Script<T>(VecDeque<Result<T, BackendError>>);

impl<T: Clone> Script<T> {
    fn next(&mut self) -> Option<Result<T, BackendError>> {
        if self.0.len() > 1 {
            self.0.pop_front()
        } else {
            self.0.front().cloned()
        }
    }
}

/// In-memory [`IntentBackend`] with scripted responses.
///
/// Unscripted ids resolve to `NotFound`. Calls are recorded before the
/// optional gate, so a held call is already visible in [`MockBackend::calls`].
pub struct MockBackend {
    payments: Mutex<HashMap<String, Script<ResolvedPaymentRequest>>>,
    tokens: Mutex<HashMap<String, Script<ResolvedTransferToken>>>,
    approvals: Mutex<Script<PaymentApproval>>,
    cancel_result: Mutex<Result<(), BackendError>>,
    calls: Mutex<Vec<BackendCall>>,
    call_count: AtomicUsize,
    call_made: Notify,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            payments: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            approvals: Mutex::new(Script(VecDeque::from([Ok(PaymentApproval::default())]))),
            cancel_result: Mutex::new(Ok(())),
            calls: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
            call_made: Notify::new(),
            gate: Mutex::new(None),
        }
    }
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_payment(
        &self,
        request_id: &str,
        responses: impl IntoIterator<Item = Result<ResolvedPaymentRequest, BackendError>>,
    ) {
        self.payments
            .lock()
            .unwrap()
            .insert(request_id.to_string(), Script(responses.into_iter().collect()));
    }

    pub fn script_token(
        &self,
        token_id: &str,
        responses: impl IntoIterator<Item = Result<ResolvedTransferToken, BackendError>>,
    ) {
        self.tokens
            .lock()
            .unwrap()
            .insert(token_id.to_string(), Script(responses.into_iter().collect()));
    }

    /// Resolve `request_id` to [`sample_payment_request`].
    pub fn with_payment(&self, request_id: &str) {
        self.script_payment(request_id, [Ok(sample_payment_request(request_id))]);
    }

    /// Resolve `token_id` to [`sample_transfer_token`].
    pub fn with_token(&self, token_id: &str) {
        self.script_token(token_id, [Ok(sample_transfer_token(token_id))]);
    }

    pub fn script_approvals(
        &self,
        responses: impl IntoIterator<Item = Result<PaymentApproval, BackendError>>,
    ) {
        *self.approvals.lock().unwrap() = Script(responses.into_iter().collect());
    }

    pub fn fail_cancel(&self, err: BackendError) {
        *self.cancel_result.lock().unwrap() = Err(err);
    }

    /// Park every subsequent call until [`MockBackend::release`] hands out permits.
    ///
    /// Calls already parked stay on the gate they found; the returned handle
    /// releases them after a newer `hold` replaced it.
    pub fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Let `n` held calls proceed.
    pub fn release(&self, n: usize) {
        if let Some(gate) = self.gate.lock().unwrap().as_ref() {
            gate.add_permits(n);
        }
    }

    /// Stop holding calls; parked and future calls proceed.
    pub fn open(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn calls_matching(&self, call: &BackendCall) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    /// Wait until at least `n` calls were recorded.
    pub async fn wait_for_calls(&self, n: usize) {
        loop {
            let notified = self.call_made.notified();
            if self.call_count() >= n {
                return;
            }
            notified.await;
        }
    }

    async fn record(&self, call: BackendCall) {
        self.calls.lock().unwrap().push(call);
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.call_made.notify_waiters();

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }
}

#[async_trait]
impl IntentBackend for MockBackend {
    async fn get_payment_details(
        &self,
        request_id: &str,
    ) -> Result<ResolvedPaymentRequest, BackendError> {
        self.record(BackendCall::GetPaymentDetails(request_id.to_string()))
            .await;
        self.payments
            .lock()
            .unwrap()
            .get_mut(request_id)
            .and_then(Script::next)
            .unwrap_or(Err(BackendError::NotFound))
    }

    async fn approve_payment(
        &self,
        request_id: &str,
        card_id: &str,
    ) -> Result<PaymentApproval, BackendError> {
        self.record(BackendCall::ApprovePayment {
            request_id: request_id.to_string(),
            card_id: card_id.to_string(),
        })
        .await;
        self.approvals
            .lock()
            .unwrap()
            .next()
            .unwrap_or_else(|| Ok(PaymentApproval::default()))
    }

    async fn cancel_payment(&self, request_id: &str) -> Result<(), BackendError> {
        self.record(BackendCall::CancelPayment(request_id.to_string()))
            .await;
        self.cancel_result.lock().unwrap().clone()
    }

    async fn resolve_transfer_token(
        &self,
        token_id: &str,
    ) -> Result<ResolvedTransferToken, BackendError> {
        self.record(BackendCall::ResolveTransferToken(token_id.to_string()))
            .await;
        self.tokens
            .lock()
            .unwrap()
            .get_mut(token_id)
            .and_then(Script::next)
            .unwrap_or(Err(BackendError::NotFound))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SESSION
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionMode {
    SignedIn,
    SignedOut,
    /// The session check errors.
    Failing,
    /// The session check never answers.
    Hanging,
}

/// [`SessionProvider`] whose answer the test controls.
pub struct StaticSession {
    mode: Mutex<SessionMode>,
    checks: AtomicUsize,
}

impl StaticSession {
    pub fn new(mode: SessionMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            checks: AtomicUsize::new(0),
        })
    }

    pub fn signed_in() -> Arc<Self> {
        Self::new(SessionMode::SignedIn)
    }

    pub fn signed_out() -> Arc<Self> {
        Self::new(SessionMode::SignedOut)
    }

    pub fn set_mode(&self, mode: SessionMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionProvider for StaticSession {
    async fn is_authenticated(&self) -> Result<bool, BackendError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        match mode {
            SessionMode::SignedIn => Ok(true),
            SessionMode::SignedOut => Ok(false),
            SessionMode::Failing => Err(BackendError::Network("session service down".into())),
            SessionMode::Hanging => std::future::pending().await,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OBSERVER
// ═══════════════════════════════════════════════════════════════════════════════

/// An observer callback as recorded. Expiry progress is counted, not recorded.
#[derive(Clone, Debug, PartialEq)]
pub enum ObservedEvent {
    Resolved(StateUpdate),
    Expired(IntentKind),
    RecoveryExhausted(IntentKind),
    LoginRequired(ParsedIntent),
    InvalidTrigger(TriggerSource, String),
}

/// [`IntentObserver`] that records every callback.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
    progress: Mutex<Vec<(IntentKind, f64)>>,
    changed: Notify,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn resolved(&self) -> Vec<StateUpdate> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ObservedEvent::Resolved(update) => Some(update),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &ObservedEvent) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| *event == wanted)
            .count()
    }

    pub fn progress(&self) -> Vec<(IntentKind, f64)> {
        self.progress.lock().unwrap().clone()
    }

    /// Wait until `ready` holds for the recorded events.
    pub async fn wait_until(&self, ready: impl Fn(&[ObservedEvent]) -> bool) {
        loop {
            let notified = self.changed.notified();
            if ready(&self.events.lock().unwrap()) {
                return;
            }
            notified.await;
        }
    }

    fn push(&self, event: ObservedEvent) {
        self.events.lock().unwrap().push(event);
        self.changed.notify_waiters();
    }
}

impl IntentObserver for RecordingObserver {
    fn on_resolved(&self, update: StateUpdate) {
        self.push(ObservedEvent::Resolved(update));
    }

    fn on_expired(&self, kind: IntentKind) {
        self.push(ObservedEvent::Expired(kind));
    }

    fn on_expiry_progress(&self, kind: IntentKind, remaining_fraction: f64) {
        self.progress
            .lock()
            .unwrap()
            .push((kind, remaining_fraction));
    }

    fn on_recovery_exhausted(&self, kind: IntentKind) {
        self.push(ObservedEvent::RecoveryExhausted(kind));
    }

    fn on_login_required(&self, intent: &ParsedIntent) {
        self.push(ObservedEvent::LoginRequired(intent.clone()));
    }

    fn on_invalid_trigger(&self, source: TriggerSource, input: &str) {
        self.push(ObservedEvent::InvalidTrigger(source, input.to_string()));
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HARNESS
// ═══════════════════════════════════════════════════════════════════════════════

/// An engine wired to mock collaborators over an in-memory store.
pub struct TestHarness {
    pub engine: IntentEngine,
    pub backend: Arc<MockBackend>,
    pub session: Arc<StaticSession>,
    pub observer: Arc<RecordingObserver>,
    pub store: PendingIntentStore,
}

impl TestHarness {
    pub fn signed_in() -> Self {
        Self::build(SessionMode::SignedIn, PendingIntentStore::in_memory(), test_config())
    }

    pub fn signed_out() -> Self {
        Self::build(SessionMode::SignedOut, PendingIntentStore::in_memory(), test_config())
    }

    pub fn build(mode: SessionMode, store: PendingIntentStore, config: EngineConfig) -> Self {
        let backend = MockBackend::new();
        let session = StaticSession::new(mode);
        let observer = RecordingObserver::new();
        let engine = IntentEngine::with_store(
            config,
            store.clone(),
            backend.clone(),
            session.clone(),
            observer.clone(),
        );
        Self {
            engine,
            backend,
            session,
            observer,
            store,
        }
    }
}

/// Default configuration with persistence disabled.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        persist_pending: false,
        ..EngineConfig::default()
    }
}
