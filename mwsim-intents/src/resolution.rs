//! Per-intent lifecycle controller.
//!
//! ```text
//! Idle ─▶ Loading ─┬─▶ Ready ─▶ Approving ─┬─▶ Success
//!                  │                       └─▶ Error
//!                  └─▶ Error ─(retryable)─▶ Loading
//! ```
//!
//! Every resolve bumps a generation counter. A response is applied only if
//! the generation it started under is still current, so a close, cancel or a
//! newer trigger silently drops whatever the superseded call returns.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{BackendError, ErrorKind, IntentError, IntentKind, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Why a resolution or approval ended in `Error`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionError {
    pub kind: ErrorKind,
    /// Technical detail for logs. Never shown to the user.
    pub detail: String,
    /// Whether the view may offer a retry action.
    pub retryable: bool,
}

impl ResolutionError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            detail: detail.into(),
            retryable,
        }
    }

    /// Fixed user-facing text for the kind.
    pub fn message(&self) -> &'static str {
        self.kind.user_message()
    }
}

/// Lifecycle state of the active intent of one kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum ResolutionState<T, S> {
    /// No active intent.
    Idle,
    Loading,
    Ready(T),
    Approving,
    Success(S),
    Error(ResolutionError),
}

impl<T, S> ResolutionState<T, S> {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Ready(_) => "ready",
            Self::Approving => "approving",
            Self::Success(_) => "success",
            Self::Error(_) => "error",
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Ready(data) => Some(data),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ResolutionError> {
        match self {
            Self::Error(err) => Some(err),
            _ => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error().map(|err| err.kind)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MACHINE
// ═══════════════════════════════════════════════════════════════════════════════

struct MachineInner<T, S> {
    state: ResolutionState<T, S>,
    active_id: Option<String>,
    generation: u64,
    in_flight: bool,
    /// Consecutive `Unknown` failures for the active id.
    unknown_failures: u32,
}

/// Owns the [`ResolutionState`] for one intent kind.
pub struct ResolutionMachine<T, S> {
    kind: IntentKind,
    timeout: Duration,
    inner: Mutex<MachineInner<T, S>>,
    state_tx: watch::Sender<ResolutionState<T, S>>,
}

impl<T, S> ResolutionMachine<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    /// `timeout` bounds every resolve and approve call.
    pub fn new(kind: IntentKind, timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(ResolutionState::Idle);
        Self {
            kind,
            timeout,
            inner: Mutex::new(MachineInner {
                state: ResolutionState::Idle,
                active_id: None,
                generation: 0,
                in_flight: false,
                unknown_failures: 0,
            }),
            state_tx,
        }
    }

    pub fn kind(&self) -> IntentKind {
        self.kind
    }

    pub fn subscribe(&self) -> watch::Receiver<ResolutionState<T, S>> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ResolutionState<T, S> {
        self.lock().state.clone()
    }

    pub fn active_id(&self) -> Option<String> {
        self.lock().active_id.clone()
    }

    /// Whether a resolve or approve call for `id` has not returned yet.
    pub fn is_in_flight(&self, id: &str) -> bool {
        let inner = self.lock();
        inner.in_flight && inner.active_id.as_deref() == Some(id)
    }

    /// Whether `id` is the active intent and already reached `Ready` or `Success`.
    pub fn has_result_for(&self, id: &str) -> bool {
        let inner = self.lock();
        inner.active_id.as_deref() == Some(id)
            && matches!(
                inner.state,
                ResolutionState::Ready(_) | ResolutionState::Success(_)
            )
    }

    /// Resolve `id` with `fetch`, moving through `Loading` immediately.
    ///
    /// A second call for the id already in flight, or any call while an
    /// approval is running, starts nothing and returns the current state. A
    /// call for a different id supersedes the active one.
    pub async fn resolve<F, Fut>(&self, id: &str, fetch: F) -> ResolutionState<T, S>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, BackendError>>,
    {
        let generation = {
            let mut inner = self.lock();
            if inner.in_flight && inner.active_id.as_deref() == Some(id) {
                tracing::debug!(kind = %self.kind, %id, "resolution already in flight");
                return inner.state.clone();
            }
            if matches!(inner.state, ResolutionState::Approving) {
                tracing::debug!(kind = %self.kind, %id, "approval in progress, resolve ignored");
                return inner.state.clone();
            }

            if inner.active_id.as_deref() != Some(id) {
                inner.unknown_failures = 0;
                inner.active_id = Some(id.to_string());
            }
            inner.generation += 1;
            inner.in_flight = true;
            self.publish(&mut inner, ResolutionState::Loading);
            inner.generation
        };

        tracing::info!(kind = %self.kind, %id, "resolving intent");
        let outcome = tokio::time::timeout(self.timeout, fetch()).await;

        let mut inner = self.lock();
        if inner.generation != generation {
            tracing::warn!(kind = %self.kind, %id, "dropping stale resolution response");
            return inner.state.clone();
        }
        inner.in_flight = false;

        let next = match outcome {
            Ok(Ok(data)) => {
                inner.unknown_failures = 0;
                ResolutionState::Ready(data)
            }
            Ok(Err(err)) => ResolutionState::Error(self.classify_failure(&mut inner, err)),
            Err(_) => ResolutionState::Error(self.timeout_error()),
        };
        tracing::info!(kind = %self.kind, %id, status = next.status(), "resolution finished");
        self.publish(&mut inner, next.clone());
        next
    }

    /// Approve the ready intent.
    ///
    /// `call` receives the resolved data and either rejects synchronously
    /// (leaving the state untouched) or returns the approval future. The
    /// machine enters `Approving` before that future is first polled. A call
    /// made while already `Approving` is a no-op.
    pub async fn approve<F, Fut>(&self, call: F) -> Result<ResolutionState<T, S>>
    where
        F: FnOnce(&T) -> Result<Fut>,
        Fut: Future<Output = std::result::Result<S, BackendError>>,
    {
        let (generation, approval) = {
            let mut inner = self.lock();
            let approval = match inner.state {
                ResolutionState::Approving => {
                    tracing::debug!(kind = %self.kind, "approval already in progress");
                    return Ok(ResolutionState::Approving);
                }
                ResolutionState::Ready(ref data) => call(data)?,
                _ => {
                    return Err(IntentError::IllegalTransition(
                        "approve is only legal from Ready",
                    ))
                }
            };
            inner.generation += 1;
            inner.in_flight = true;
            self.publish(&mut inner, ResolutionState::Approving);
            (inner.generation, approval)
        };

        let outcome = tokio::time::timeout(self.timeout, approval).await;

        let mut inner = self.lock();
        if inner.generation != generation {
            tracing::warn!(kind = %self.kind, "dropping stale approval response");
            return Ok(inner.state.clone());
        }
        inner.in_flight = false;

        let next = match outcome {
            Ok(Ok(result)) => ResolutionState::Success(result),
            Ok(Err(err)) => ResolutionState::Error(self.classify_failure(&mut inner, err)),
            Err(_) => ResolutionState::Error(self.timeout_error()),
        };
        tracing::info!(kind = %self.kind, status = next.status(), "approval finished");
        self.publish(&mut inner, next.clone());
        Ok(next)
    }

    /// The id to re-resolve, if the current error allows a retry.
    pub fn retry_target(&self) -> Result<String> {
        let inner = self.lock();
        match (&inner.state, &inner.active_id) {
            (ResolutionState::Error(err), Some(id)) if err.retryable => Ok(id.clone()),
            (ResolutionState::Error(_), _) => Err(IntentError::IllegalTransition(
                "error is not retryable",
            )),
            _ => Err(IntentError::IllegalTransition(
                "retry is only legal from Error",
            )),
        }
    }

    /// Forget the active intent and return to `Idle`.
    ///
    /// An in-flight call is not cancelled; its response is dropped when it
    /// arrives. Returns the id that was active.
    pub fn reset(&self) -> Option<String> {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.in_flight = false;
        inner.unknown_failures = 0;
        let previous = inner.active_id.take();
        self.publish(&mut inner, ResolutionState::Idle);
        if let Some(ref id) = previous {
            tracing::info!(kind = %self.kind, %id, "intent closed");
        }
        previous
    }

    fn classify_failure(
        &self,
        inner: &mut MachineInner<T, S>,
        err: BackendError,
    ) -> ResolutionError {
        let kind = err.kind();
        let retryable = match kind {
            ErrorKind::Unknown => {
                inner.unknown_failures += 1;
                inner.unknown_failures == 1
            }
            kind => kind.is_transient(),
        };
        ResolutionError::new(kind, err.to_string(), retryable)
    }

    fn timeout_error(&self) -> ResolutionError {
        ResolutionError::new(
            ErrorKind::Timeout,
            format!("no response within {}s", self.timeout.as_secs()),
            true,
        )
    }

    fn publish(&self, inner: &mut MachineInner<T, S>, state: ResolutionState<T, S>) {
        inner.state = state.clone();
        self.state_tx.send_replace(state);
    }

    fn lock(&self) -> MutexGuard<'_, MachineInner<T, S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T, S> std::fmt::Debug for ResolutionMachine<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionMachine")
            .field("kind", &self.kind)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
