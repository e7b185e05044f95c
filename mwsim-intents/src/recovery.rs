//! Replay of intents left pending by an interrupted session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{ErrorKind, IntentKind, ParsedIntent, PendingIntentStore, Result};

/// How a replayed intent ended, as far as recovery is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Resolution reached `Ready`.
    Resolved,
    /// Resolution ended in `Error` of this kind.
    Failed(ErrorKind),
    /// Another resolution of the same kind is in flight.
    Busy,
    /// The user must log in first.
    Deferred,
    /// The intent is already resolved on screen; nothing was replayed.
    Active,
}

/// Runs the live resolution path for a recovered intent.
#[async_trait]
pub trait IntentReplay: Send + Sync {
    async fn replay(&self, intent: ParsedIntent) -> ReplayOutcome;

    /// Called once per entry when its transient failures reach the limit.
    fn recovery_exhausted(&self, kind: IntentKind);
}

/// What recovery did with one pending entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Resolved; entry cleared.
    Resolved,
    /// Terminal failure; entry cleared.
    Cleared { error: ErrorKind },
    /// Transient failure; entry kept for the next pass.
    Retained { error: ErrorKind, attempts: u32 },
    /// Not authenticated; entry kept.
    Deferred,
    /// Another resolution was in flight; entry kept.
    Busy,
    /// Transient failures hit the limit on this pass; entry kept.
    Exhausted { attempts: u32 },
    /// Limit was hit on an earlier pass; not replayed.
    Suppressed,
    /// Already resolved by a live trigger and awaiting the user; entry kept.
    Active,
}

impl RecoveryAction {
    pub fn cleared_entry(&self) -> bool {
        matches!(self, Self::Resolved | Self::Cleared { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveredEntry {
    pub kind: IntentKind,
    pub id: String,
    #[serde(flatten)]
    pub action: RecoveryAction,
}

/// Outcome of one `recover()` pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub entries: Vec<RecoveredEntry>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn action(&self, kind: IntentKind) -> Option<&RecoveryAction> {
        self.entries
            .iter()
            .find(|entry| entry.kind == kind)
            .map(|entry| &entry.action)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COORDINATOR
// ═══════════════════════════════════════════════════════════════════════════════

/// Reads the pending store and replays what it finds.
pub struct RecoveryCoordinator {
    store: PendingIntentStore,
    max_attempts: u32,
    /// Transient failures per entry. In memory only: a restart starts over.
    attempts: Mutex<HashMap<(IntentKind, String), u32>>,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RecoveryCoordinator {
    pub fn new(store: PendingIntentStore, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
            attempts: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Transient failures recorded for the entry.
    pub fn attempts(&self, kind: IntentKind, id: &str) -> u32 {
        self.lock_attempts()
            .get(&(kind, id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Replay every pending entry, payment first.
    ///
    /// Entries are cleared on resolution or on a terminal failure, and only if
    /// they were not replaced by a newer trigger meanwhile. A call made while
    /// another pass is running returns an empty report.
    pub async fn recover(&self, replay: &dyn IntentReplay) -> Result<RecoveryReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("recovery already running");
            return Ok(RecoveryReport::default());
        }
        let _running = RunningGuard(&self.running);

        let mut report = RecoveryReport::default();
        for kind in IntentKind::ALL {
            let Some(entry) = self.store.load(kind)? else {
                continue;
            };
            let id = entry.id.clone();
            let key = (kind, id.clone());

            if self.attempts(kind, &id) >= self.max_attempts {
                tracing::debug!(%kind, %id, "recovery exhausted earlier, skipping");
                report.entries.push(RecoveredEntry {
                    kind,
                    id,
                    action: RecoveryAction::Suppressed,
                });
                continue;
            }

            tracing::info!(%kind, %id, "replaying pending intent");
            let action = match replay.replay(entry.into_intent()).await {
                ReplayOutcome::Resolved => {
                    self.store.clear_if_matches(kind, &id)?;
                    self.lock_attempts().remove(&key);
                    RecoveryAction::Resolved
                }
                ReplayOutcome::Failed(error) if error.clears_pending() => {
                    self.store.clear_if_matches(kind, &id)?;
                    self.lock_attempts().remove(&key);
                    RecoveryAction::Cleared { error }
                }
                ReplayOutcome::Failed(error) => {
                    let attempts = {
                        let mut map = self.lock_attempts();
                        let count = map.entry(key).or_insert(0);
                        *count += 1;
                        *count
                    };
                    if attempts >= self.max_attempts {
                        tracing::warn!(%kind, %id, attempts, "recovery attempts exhausted");
                        replay.recovery_exhausted(kind);
                        RecoveryAction::Exhausted { attempts }
                    } else {
                        tracing::info!(%kind, %id, %error, attempts, "transient failure, entry retained");
                        RecoveryAction::Retained { error, attempts }
                    }
                }
                ReplayOutcome::Busy => RecoveryAction::Busy,
                ReplayOutcome::Deferred => RecoveryAction::Deferred,
                ReplayOutcome::Active => {
                    tracing::debug!(%kind, %id, "intent already active, entry kept");
                    RecoveryAction::Active
                }
            };
            report.entries.push(RecoveredEntry { kind, id, action });
        }

        Ok(report)
    }

    fn lock_attempts(&self) -> MutexGuard<'_, HashMap<(IntentKind, String), u32>> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RecoveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryCoordinator")
            .field("store", &self.store)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PendingEntry;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tokio::sync::{oneshot, Mutex as AsyncMutex};

    #[derive(Default)]
    struct ScriptedReplay {
        outcomes: Mutex<VecDeque<ReplayOutcome>>,
        replayed: Mutex<Vec<ParsedIntent>>,
        exhausted: Mutex<Vec<IntentKind>>,
        gate: AsyncMutex<Option<oneshot::Receiver<()>>>,
    }

    impl ScriptedReplay {
        fn with(outcomes: impl IntoIterator<Item = ReplayOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into_iter().collect()),
                ..Default::default()
            }
        }

        fn replay_count(&self) -> usize {
            self.replayed.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl IntentReplay for ScriptedReplay {
        async fn replay(&self, intent: ParsedIntent) -> ReplayOutcome {
            self.replayed.lock().unwrap().push(intent);
            if let Some(gate) = self.gate.lock().await.take() {
                let _ = gate.await;
            }
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ReplayOutcome::Resolved)
        }

        fn recovery_exhausted(&self, kind: IntentKind) {
            self.exhausted.lock().unwrap().push(kind);
        }
    }

    fn seeded() -> PendingIntentStore {
        let store = PendingIntentStore::in_memory();
        store
            .save(&PendingEntry::transfer_token("tok_1"))
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_terminal_failure_clears_and_second_pass_is_noop() {
        let store = seeded();
        let coordinator = RecoveryCoordinator::new(store.clone(), 5);
        let replay = ScriptedReplay::with([ReplayOutcome::Failed(ErrorKind::NotFound)]);

        let report = coordinator.recover(&replay).await.unwrap();
        assert_eq!(
            report.action(IntentKind::TransferToken),
            Some(&RecoveryAction::Cleared {
                error: ErrorKind::NotFound
            })
        );
        assert_eq!(store.load(IntentKind::TransferToken).unwrap(), None);

        let second = coordinator.recover(&replay).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(replay.replay_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_entry() {
        let store = seeded();
        let coordinator = RecoveryCoordinator::new(store.clone(), 5);
        let replay = ScriptedReplay::with([
            ReplayOutcome::Failed(ErrorKind::Network),
            ReplayOutcome::Failed(ErrorKind::Timeout),
            ReplayOutcome::Resolved,
        ]);

        for expected in [1, 2] {
            let report = coordinator.recover(&replay).await.unwrap();
            assert!(matches!(
                report.action(IntentKind::TransferToken),
                Some(RecoveryAction::Retained { attempts, .. }) if *attempts == expected
            ));
            assert!(store.load(IntentKind::TransferToken).unwrap().is_some());
        }

        let report = coordinator.recover(&replay).await.unwrap();
        assert_eq!(
            report.action(IntentKind::TransferToken),
            Some(&RecoveryAction::Resolved)
        );
        assert_eq!(store.load(IntentKind::TransferToken).unwrap(), None);
        assert_eq!(coordinator.attempts(IntentKind::TransferToken, "tok_1"), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_notifies_once_and_suppresses() {
        let store = seeded();
        let coordinator = RecoveryCoordinator::new(store.clone(), 2);
        let replay = ScriptedReplay::with(
            std::iter::repeat(ReplayOutcome::Failed(ErrorKind::Network)).take(10),
        );

        coordinator.recover(&replay).await.unwrap();
        let report = coordinator.recover(&replay).await.unwrap();
        assert_eq!(
            report.action(IntentKind::TransferToken),
            Some(&RecoveryAction::Exhausted { attempts: 2 })
        );

        let report = coordinator.recover(&replay).await.unwrap();
        assert_eq!(
            report.action(IntentKind::TransferToken),
            Some(&RecoveryAction::Suppressed)
        );
        assert_eq!(replay.replay_count(), 2);
        assert_eq!(*replay.exhausted.lock().unwrap(), [IntentKind::TransferToken]);
        assert!(store.load(IntentKind::TransferToken).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_deferred_and_busy_keep_entry() {
        let store = seeded();
        store
            .save(&PendingEntry::payment("req_1", Some("Safari".into())))
            .unwrap();
        let coordinator = RecoveryCoordinator::new(store.clone(), 5);
        let replay = ScriptedReplay::with([ReplayOutcome::Deferred, ReplayOutcome::Busy]);

        let report = coordinator.recover(&replay).await.unwrap();
        assert_eq!(report.action(IntentKind::Payment), Some(&RecoveryAction::Deferred));
        assert_eq!(
            report.action(IntentKind::TransferToken),
            Some(&RecoveryAction::Busy)
        );
        assert!(store.load(IntentKind::Payment).unwrap().is_some());
        assert!(store.load(IntentKind::TransferToken).unwrap().is_some());

        // The source browser rides along with the replayed payment.
        let replayed = replay.replayed.lock().unwrap();
        assert_eq!(
            replayed[0],
            ParsedIntent::from(crate::PaymentIntent::new("req_1").with_source_browser("Safari"))
        );
    }

    #[tokio::test]
    async fn test_active_intent_keeps_entry_without_counting() {
        let store = seeded();
        let coordinator = RecoveryCoordinator::new(store.clone(), 1);
        let replay = ScriptedReplay::with([ReplayOutcome::Active, ReplayOutcome::Active]);

        for _ in 0..2 {
            let report = coordinator.recover(&replay).await.unwrap();
            assert_eq!(
                report.action(IntentKind::TransferToken),
                Some(&RecoveryAction::Active)
            );
        }
        assert!(!RecoveryAction::Active.cleared_entry());
        assert_eq!(coordinator.attempts(IntentKind::TransferToken, "tok_1"), 0);
        assert!(replay.exhausted.lock().unwrap().is_empty());
        assert!(store.load(IntentKind::TransferToken).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_newer_entry_survives_clear() {
        let store = seeded();
        let coordinator = Arc::new(RecoveryCoordinator::new(store.clone(), 5));
        let (release, gate) = oneshot::channel();
        let replay = Arc::new(ScriptedReplay::with([ReplayOutcome::Failed(ErrorKind::Expired)]));
        *replay.gate.lock().await = Some(gate);

        let pass = {
            let coordinator = Arc::clone(&coordinator);
            let replay = Arc::clone(&replay);
            tokio::spawn(async move { coordinator.recover(replay.as_ref()).await })
        };
        while replay.replay_count() == 0 {
            tokio::task::yield_now().await;
        }

        // A live trigger lands while the old token is being replayed.
        store.save(&PendingEntry::transfer_token("tok_2")).unwrap();
        // Overlapping passes collapse into the running one.
        assert!(coordinator.recover(replay.as_ref()).await.unwrap().is_empty());

        release.send(()).unwrap();
        pass.await.unwrap().unwrap();
        assert_eq!(
            store.load(IntentKind::TransferToken).unwrap(),
            Some(PendingEntry::transfer_token("tok_2"))
        );
    }
}
