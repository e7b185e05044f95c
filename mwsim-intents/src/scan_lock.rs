//! Synchronous per-scanner guard against duplicate scan resolution.
//!
//! The camera can deliver several callbacks for the same code before any
//! asynchronous state update lands, so the guard is a plain atomic flag that is
//! flipped at the call site, never derived from observed state.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::IntentKind;

/// Logical scanners. Each owns its own lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerId {
    /// Home-screen scanner; accepts payment and transfer codes.
    General,
    /// Scanner opened from the P2P send flow; transfer codes only.
    P2p,
}

impl ScannerId {
    pub fn accepts(self, kind: IntentKind) -> bool {
        match self {
            Self::General => true,
            Self::P2p => kind == IntentKind::TransferToken,
        }
    }
}

/// A boolean guard flipped only at acquire/release call sites.
#[derive(Debug, Default)]
pub struct ScanLock {
    held: AtomicBool,
}

impl ScanLock {
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Take the lock. Returns `false` and does nothing when already held.
    pub fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the lock, returning whether it was held.
    ///
    /// Only the first release after an acquire observes `true`.
    pub fn release(&self) -> bool {
        self.held.swap(false, Ordering::AcqRel)
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// One lock per logical scanner.
#[derive(Debug, Default)]
pub struct ScanLocks {
    general: ScanLock,
    p2p: ScanLock,
}

impl ScanLocks {
    pub fn get(&self, scanner: ScannerId) -> &ScanLock {
        match scanner {
            ScannerId::General => &self.general,
            ScannerId::P2p => &self.p2p,
        }
    }
}
