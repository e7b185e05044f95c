//! # Payment & Transfer Intent Resolution for mwsim
//!
//! This crate turns the wallet's external triggers into one of two canonical
//! intents and drives each through a resolution lifecycle exactly once.
//!
//! ## Overview
//!
//! Triggers arrive from deep links, camera scans, notification taps and from
//! state persisted by an interrupted session. Each is classified into a
//! merchant [`PaymentIntent`] or a P2P/merchant [`TransferTokenIntent`],
//! written to the [`PendingIntentStore`] before the session check, and then
//! resolved against the backend by a [`ResolutionMachine`].
//!
//! ```text
//!  deep link ─┐
//!  QR scan  ──┼─▶ parser ─▶ pending store ─▶ session? ─┬─ no ─▶ login (queued)
//!  push tap ──┘                 ▲                      │
//!                               │                      └─ yes ─▶ resolution machine ─▶ observer
//!  app start / login ─▶ recovery┘                                      │
//!                                                                      └─▶ expiry timer
//! ```
//!
//! The [`IntentEngine`] is the single ingress the surrounding app calls.

mod backend;
mod config;
mod engine;
mod error;
mod expiry;
mod notification;
mod parser;
mod recovery;
mod resolution;
mod scan_lock;
mod store;
mod types;

pub use backend::{IntentBackend, SessionProvider};
pub use config::EngineConfig;
pub use engine::{
    IntentEngine, IntentObserver, NoopObserver, PaymentState, ScanDispatch, StateUpdate,
    TransferState, TriggerDispatch,
};
pub use error::{BackendError, ErrorKind, IntentError, Result};
pub use expiry::{ExpiryHandle, ExpiryTick, ExpiryTimer, ExpiryWindow};
pub use notification::NotificationPayload;
pub use parser::{classify, is_valid_id, parse, Classification, LinkEnvironment, TriggerSource};
pub use recovery::{
    IntentReplay, RecoveredEntry, RecoveryAction, RecoveryCoordinator, RecoveryReport,
    ReplayOutcome,
};
pub use resolution::{ResolutionError, ResolutionMachine, ResolutionState};
pub use scan_lock::{ScanLock, ScanLocks, ScannerId};
pub use store::{
    PendingEntry, PendingIntentStore, PENDING_PAYMENT_REQUEST_ID_KEY,
    PENDING_PAYMENT_SOURCE_BROWSER_KEY, PENDING_TRANSFER_TOKEN_ID_KEY,
};
pub use types::{
    EligibleCard, IntentKind, OrderDetails, OrderLineItem, ParsedIntent, PaymentApproval,
    PaymentIntent, PaymentOutcome, RecipientKind, ResolvedPaymentRequest, ResolvedTransferToken,
    TransferTokenIntent,
};

/// Production host for transfer-token universal links
pub const TRANSFER_HOST: &str = "transfer.banksim.ca";

/// Development host for transfer-token universal links
pub const TRANSFER_DEV_HOST: &str = "transfersim-dev.banksim.ca";

/// Production host for payment-request universal links
pub const PAYMENT_HOST: &str = "wsim.banksim.ca";

/// Development host for payment-request universal links
pub const PAYMENT_DEV_HOST: &str = "wsim-dev.banksim.ca";

/// The wallet's custom URL scheme
pub const APP_SCHEME: &str = "mwsim";

/// Custom scheme used by older transfer QR codes
pub const LEGACY_TRANSFER_SCHEME: &str = "tsim";

/// Query parameter naming the browser that opened a payment link
pub const SOURCE_BROWSER_PARAM: &str = "sourceBrowser";
