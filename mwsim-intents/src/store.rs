//! Durable storage for at most one pending intent per kind.
//!
//! Entries are written as soon as a trigger is classified, before the session
//! check, so a process killed while the user logs in does not lose the intent.
//! A save always replaces the previous entry of its kind; there is no merge.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Db;

use crate::{
    EngineConfig, IntentError, IntentKind, ParsedIntent, PaymentIntent, Result,
    TransferTokenIntent,
};

/// Key holding the pending payment request id.
pub const PENDING_PAYMENT_REQUEST_ID_KEY: &str = "pendingPaymentRequestId";
/// Key holding the browser that opened the pending payment.
pub const PENDING_PAYMENT_SOURCE_BROWSER_KEY: &str = "pendingPaymentSourceBrowser";
/// Key holding the pending transfer token id.
pub const PENDING_TRANSFER_TOKEN_ID_KEY: &str = "pendingTransferSimTokenId";

/// A persisted, not yet resolved intent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub kind: IntentKind,
    pub id: String,
    /// Only meaningful for payments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_browser: Option<String>,
}

impl PendingEntry {
    pub fn payment(request_id: impl Into<String>, source_browser: Option<String>) -> Self {
        Self {
            kind: IntentKind::Payment,
            id: request_id.into(),
            source_browser,
        }
    }

    pub fn transfer_token(token_id: impl Into<String>) -> Self {
        Self {
            kind: IntentKind::TransferToken,
            id: token_id.into(),
            source_browser: None,
        }
    }

    pub fn into_intent(self) -> ParsedIntent {
        match self.kind {
            IntentKind::Payment => ParsedIntent::Payment(PaymentIntent {
                request_id: self.id,
                source_browser: self.source_browser,
            }),
            IntentKind::TransferToken => TransferTokenIntent::new(self.id).into(),
        }
    }
}

impl From<&ParsedIntent> for PendingEntry {
    fn from(intent: &ParsedIntent) -> Self {
        match intent {
            ParsedIntent::Payment(payment) => {
                Self::payment(payment.request_id.clone(), payment.source_browser.clone())
            }
            ParsedIntent::TransferToken(token) => Self::transfer_token(token.token_id.clone()),
        }
    }
}

fn id_key(kind: IntentKind) -> &'static str {
    match kind {
        IntentKind::Payment => PENDING_PAYMENT_REQUEST_ID_KEY,
        IntentKind::TransferToken => PENDING_TRANSFER_TOKEN_ID_KEY,
    }
}

fn aux_key(kind: IntentKind) -> Option<&'static str> {
    match kind {
        IntentKind::Payment => Some(PENDING_PAYMENT_SOURCE_BROWSER_KEY),
        IntentKind::TransferToken => None,
    }
}

fn kind_keys(kind: IntentKind) -> impl Iterator<Item = &'static str> {
    std::iter::once(id_key(kind)).chain(aux_key(kind))
}

// ═══════════════════════════════════════════════════════════════════════════════
// STORE
// ═══════════════════════════════════════════════════════════════════════════════

/// Typed pending-intent store keyed by [`IntentKind`].
#[derive(Clone)]
pub struct PendingIntentStore {
    backend: Arc<StoreBackend>,
}

enum StoreBackend {
    InMemory(Mutex<HashMap<&'static str, String>>),
    Persistent(Db),
}

impl std::fmt::Debug for PendingIntentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match &*self.backend {
            StoreBackend::InMemory(_) => "in_memory",
            StoreBackend::Persistent(_) => "persistent",
        };
        f.debug_struct("PendingIntentStore")
            .field("backend", &backend)
            .finish()
    }
}

impl PendingIntentStore {
    /// A store that does not survive the process. Used in tests and when
    /// persistence is disabled.
    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(StoreBackend::InMemory(Mutex::new(HashMap::new()))),
        }
    }

    /// Open (or create) a sled-backed store at `path`.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let db = sled::open(path_ref).map_err(|err| {
            IntentError::Storage(format!(
                "failed to open pending-intent db at {}: {err}",
                path_ref.display()
            ))
        })?;
        Ok(Self {
            backend: Arc::new(StoreBackend::Persistent(db)),
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        if config.persist_pending {
            Self::persistent(config.pending_db_path())
        } else {
            Ok(Self::in_memory())
        }
    }

    /// Persist `entry`, superseding any previous entry of the same kind.
    pub fn save(&self, entry: &PendingEntry) -> Result<()> {
        let kind = entry.kind;
        let aux = aux_key(kind).zip(entry.source_browser.as_deref());

        match &*self.backend {
            StoreBackend::InMemory(map) => {
                let mut guard = lock(map);
                for key in kind_keys(kind) {
                    guard.remove(key);
                }
                guard.insert(id_key(kind), entry.id.clone());
                if let Some((key, value)) = aux {
                    guard.insert(key, value.to_string());
                }
            }
            StoreBackend::Persistent(db) => {
                let mut batch = sled::Batch::default();
                for key in kind_keys(kind) {
                    batch.remove(key.as_bytes());
                }
                batch.insert(id_key(kind).as_bytes(), entry.id.as_bytes());
                if let Some((key, value)) = aux {
                    batch.insert(key.as_bytes(), value.as_bytes());
                }
                db.apply_batch(batch)?;
                db.flush()?;
            }
        }

        tracing::debug!(%kind, id = %entry.id, "saved pending intent");
        Ok(())
    }

    /// The pending entry for `kind`, if any.
    pub fn load(&self, kind: IntentKind) -> Result<Option<PendingEntry>> {
        let (id, source_browser) = match &*self.backend {
            StoreBackend::InMemory(map) => {
                let guard = lock(map);
                let id = guard.get(id_key(kind)).cloned();
                let aux = aux_key(kind).and_then(|key| guard.get(key).cloned());
                (id, aux)
            }
            StoreBackend::Persistent(db) => {
                let id = read_string(db, id_key(kind))?;
                let aux = match aux_key(kind) {
                    Some(key) => read_string(db, key)?,
                    None => None,
                };
                (id, aux)
            }
        };

        Ok(id.map(|id| PendingEntry {
            kind,
            id,
            source_browser: source_browser.filter(|_| kind == IntentKind::Payment),
        }))
    }

    /// Remove the entry for `kind` unconditionally.
    pub fn clear(&self, kind: IntentKind) -> Result<()> {
        match &*self.backend {
            StoreBackend::InMemory(map) => {
                let mut guard = lock(map);
                for key in kind_keys(kind) {
                    guard.remove(key);
                }
            }
            StoreBackend::Persistent(db) => {
                let mut batch = sled::Batch::default();
                for key in kind_keys(kind) {
                    batch.remove(key.as_bytes());
                }
                db.apply_batch(batch)?;
                db.flush()?;
            }
        }

        tracing::debug!(%kind, "cleared pending intent");
        Ok(())
    }

    /// Remove the entry for `kind` only if it still holds `id`.
    ///
    /// Returns whether an entry was removed. A newer entry written by a later
    /// trigger is left in place.
    pub fn clear_if_matches(&self, kind: IntentKind, id: &str) -> Result<bool> {
        let cleared = match &*self.backend {
            StoreBackend::InMemory(map) => {
                let mut guard = lock(map);
                let matches = guard.get(id_key(kind)).map(String::as_str) == Some(id);
                if matches {
                    for key in kind_keys(kind) {
                        guard.remove(key);
                    }
                }
                matches
            }
            StoreBackend::Persistent(db) => {
                let cleared = db
                    .transaction(|tx| {
                        let matches = tx
                            .get(id_key(kind).as_bytes())?
                            .map(|stored| stored.as_ref() == id.as_bytes())
                            .unwrap_or(false);
                        if matches {
                            for key in kind_keys(kind) {
                                tx.remove(key.as_bytes())?;
                            }
                        }
                        Ok::<bool, ConflictableTransactionError<()>>(matches)
                    })
                    .map_err(|err: TransactionError<()>| {
                        IntentError::Storage(format!("pending-intent transaction failed: {err:?}"))
                    })?;
                if cleared {
                    db.flush()?;
                }
                cleared
            }
        };

        if cleared {
            tracing::debug!(%kind, %id, "cleared pending intent");
        }
        Ok(cleared)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_string(db: &Db, key: &str) -> Result<Option<String>> {
    db.get(key.as_bytes())?
        .map(|value| {
            String::from_utf8(value.to_vec()).map_err(|err| {
                IntentError::Storage(format!("pending-intent value for {key} is not utf-8: {err}"))
            })
        })
        .transpose()
}
