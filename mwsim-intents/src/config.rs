//! Configuration for the intent engine.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::{IntentError, IntentKind, Result};

/// Directory name under the platform data dir.
const DATA_DIR_NAME: &str = "mwsim";
/// sled database directory under `data_dir`.
const PENDING_DB_NAME: &str = "pending-intents";
/// Longest accepted validity window (one year).
const MAX_VALIDITY_SECS: u64 = 365 * 24 * 60 * 60;

/// Engine configuration. Every field has a default.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding durable engine state.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Keep pending intents on disk. When false they live in memory only.
    #[serde(default = "bool_true")]
    pub persist_pending: bool,

    /// Upper bound on a single resolve or approve call.
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_secs: u64,

    /// Upper bound on asking the session provider whether the user is signed in.
    #[serde(default = "default_session_check_timeout")]
    pub session_check_timeout_secs: u64,

    /// Validity window assumed for payment requests when only the expiry is known.
    #[serde(default = "default_validity")]
    pub payment_validity_secs: u64,

    /// Validity window assumed for transfer tokens when only the expiry is known.
    #[serde(default = "default_validity")]
    pub transfer_token_validity_secs: u64,

    /// Transient recovery failures tolerated per pending entry before the view is told.
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DATA_DIR_NAME)
}

fn bool_true() -> bool {
    true
}

fn default_resolve_timeout() -> u64 {
    15
}

fn default_session_check_timeout() -> u64 {
    10
}

fn default_validity() -> u64 {
    300
}

fn default_max_recovery_attempts() -> u32 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            persist_pending: true,
            resolve_timeout_secs: default_resolve_timeout(),
            session_check_timeout_secs: default_session_check_timeout(),
            payment_validity_secs: default_validity(),
            transfer_token_validity_secs: default_validity(),
            max_recovery_attempts: default_max_recovery_attempts(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `MWSIM_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = env::var("MWSIM_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(persist) = parse_env("MWSIM_PERSIST_PENDING")? {
            config.persist_pending = persist;
        }
        if let Some(secs) = parse_env("MWSIM_RESOLVE_TIMEOUT_SECS")? {
            config.resolve_timeout_secs = secs;
        }
        if let Some(secs) = parse_env("MWSIM_SESSION_CHECK_TIMEOUT_SECS")? {
            config.session_check_timeout_secs = secs;
        }
        if let Some(secs) = parse_env("MWSIM_PAYMENT_VALIDITY_SECS")? {
            config.payment_validity_secs = secs;
        }
        if let Some(secs) = parse_env("MWSIM_TRANSFER_TOKEN_VALIDITY_SECS")? {
            config.transfer_token_validity_secs = secs;
        }
        if let Some(attempts) = parse_env("MWSIM_MAX_RECOVERY_ATTEMPTS")? {
            config.max_recovery_attempts = attempts;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| IntentError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("resolve_timeout_secs", self.resolve_timeout_secs),
            ("session_check_timeout_secs", self.session_check_timeout_secs),
            ("payment_validity_secs", self.payment_validity_secs),
            ("transfer_token_validity_secs", self.transfer_token_validity_secs),
            ("max_recovery_attempts", u64::from(self.max_recovery_attempts)),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(IntentError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        for (name, value) in [
            ("payment_validity_secs", self.payment_validity_secs),
            ("transfer_token_validity_secs", self.transfer_token_validity_secs),
        ] {
            if value > MAX_VALIDITY_SECS {
                return Err(IntentError::InvalidConfig(format!(
                    "{name} must be at most {MAX_VALIDITY_SECS}"
                )));
            }
        }
        Ok(())
    }

    pub fn pending_db_path(&self) -> PathBuf {
        self.data_dir.join(PENDING_DB_NAME)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    pub fn session_check_timeout(&self) -> Duration {
        Duration::from_secs(self.session_check_timeout_secs)
    }

    /// Validity window used to derive an expiry window's start.
    pub fn validity(&self, kind: IntentKind) -> chrono::Duration {
        let secs = match kind {
            IntentKind::Payment => self.payment_validity_secs,
            IntentKind::TransferToken => self.transfer_token_validity_secs,
        };
        // Fields are public, so clamp even though validate() bounds them.
        chrono::Duration::seconds(secs.min(MAX_VALIDITY_SECS) as i64)
    }
}

fn parse_env<T: std::str::FromStr>(var: &str) -> Result<Option<T>> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| IntentError::InvalidConfig(format!("{var}={value} is not valid"))),
        Err(_) => Ok(None),
    }
}
