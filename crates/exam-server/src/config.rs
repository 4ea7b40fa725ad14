//! Server Configuration
//!
//! Built once in `main` from the environment (after `dotenvy` has loaded the
//! secrets file) and shared read-only.

use std::path::PathBuf;
use std::time::Duration;

use exam_payments::{PaymentsConfig, ReconcileSettings};

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8501";
pub const DEFAULT_DATABASE_PATH: &str = "exam.db";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_path: PathBuf,

    /// Hosted URL, used for provider callbacks
    pub public_base_url: Option<String>,

    pub reconcile: ReconcileSettings,
    pub reconcile_interval: Duration,

    pub payments: PaymentsConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mut reconcile = ReconcileSettings::default();
        if let Some(minutes) = number(&var, "RECONCILE_AFTER_MINUTES") {
            reconcile.after = chrono::Duration::minutes(minutes);
        }
        let reconcile_interval =
            Duration::from_secs(number(&var, "RECONCILE_INTERVAL_SECS").map_or(300, i64::unsigned_abs));

        Self {
            bind_addr: non_empty("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.into()),
            database_path: non_empty("DATABASE_PATH")
                .unwrap_or_else(|| DEFAULT_DATABASE_PATH.into())
                .into(),
            public_base_url: non_empty("PUBLIC_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
            reconcile,
            reconcile_interval,
            payments: PaymentsConfig::from_vars(&var),
        }
    }
}

/// Positive integer variable; anything else falls back to the default
fn number(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<i64> {
    let raw = var(key)?;
    match raw.trim().parse::<i64>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            tracing::warn!(key, value = %raw, "Ignoring invalid number - using default");
            None
        }
    }
}
