//! Per-user quota accounting.
//!
//! Counters live behind the [`QuotaLedger`] trait and are only ever changed
//! through its atomic operations. The admission decision itself is the pure
//! function in [`admission`]; the ledgers call it while holding their write
//! lock so that check and increment cannot be separated by another writer.

pub mod admission;
pub mod audit;
pub mod memory;
pub mod recorder;
pub mod sqlite;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use self::admission::{Decision, admit};
pub use self::audit::spawn_audit_logger;
pub use self::memory::MemoryLedger;
pub use self::recorder::{Settlement, UsageRecorder};
pub use self::sqlite::SqliteLedger;

/// The two metering units. Text is counted in whole provider tokens, images
/// in fractional price units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Text,
    Image,
}

impl UnitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An amount of usage in one unit kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "amount", rename_all = "lowercase")]
pub enum Units {
    Text(u64),
    Image(f64),
}

impl Units {
    pub fn zero(kind: UnitKind) -> Self {
        match kind {
            UnitKind::Text => Self::Text(0),
            UnitKind::Image => Self::Image(0.0),
        }
    }

    pub fn kind(&self) -> UnitKind {
        match self {
            Self::Text(_) => UnitKind::Text,
            Self::Image(_) => UnitKind::Image,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Text(n) => n as f64,
            Self::Image(x) => x,
        }
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(n) => write!(f, "{n}"),
            Self::Image(x) => write!(f, "{x}"),
        }
    }
}

/// The price of a request as known before it is dispatched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cost {
    /// Known exactly before the call; reserved at admission.
    Upfront(Units),
    /// Only known from the provider's usage report after the call.
    Deferred(UnitKind),
}

impl Cost {
    pub fn kind(&self) -> UnitKind {
        match self {
            Self::Upfront(units) => units.kind(),
            Self::Deferred(kind) => *kind,
        }
    }

    /// Units taken from the ledger at admission time, if any.
    pub fn reserved(&self) -> Option<Units> {
        match self {
            Self::Upfront(units) => Some(*units),
            Self::Deferred(_) => None,
        }
    }
}

/// Consumption counters and limits for a single user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserQuota {
    pub user_id: String,
    pub text_units_consumed: u64,
    pub text_unit_limit: u64,
    pub image_units_consumed: f64,
    pub image_unit_limit: f64,
    pub created_at: String,
    pub updated_at: String,
}

impl UserQuota {
    pub fn consumed(&self, kind: UnitKind) -> f64 {
        match kind {
            UnitKind::Text => self.text_units_consumed as f64,
            UnitKind::Image => self.image_units_consumed,
        }
    }

    pub fn limit(&self, kind: UnitKind) -> f64 {
        match kind {
            UnitKind::Text => self.text_unit_limit as f64,
            UnitKind::Image => self.image_unit_limit,
        }
    }
}

/// Limits applied when provisioning a user or changed by an administrator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub text_unit_limit: u64,
    pub image_unit_limit: f64,
}

/// A request that would take a user past their limit.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind} quota exceeded: consumed {consumed} of {limit}, request needs {requested}")]
pub struct QuotaExceeded {
    pub kind: UnitKind,
    pub consumed: f64,
    pub limit: f64,
    /// Zero for deferred-cost requests.
    pub requested: f64,
}

/// Outcome of [`QuotaLedger::reserve`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// Admitted. For upfront costs the quota already includes the reservation.
    Granted(UserQuota),
    Denied(QuotaExceeded),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("no quota record for user '{0}'")]
    NotFound(String),

    #[error("{0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Durable per-user counters.
///
/// All methods are blocking; async callers go through [`blocking`]. Every
/// mutating method is atomic with respect to concurrent calls for the same
/// user.
pub trait QuotaLedger: Send + Sync {
    /// Short backend name for logs and `/health`.
    fn backend(&self) -> &'static str;

    fn get(&self, user_id: &str) -> Result<UserQuota, LedgerError>;

    /// Create the user's record with zeroed counters. An existing record is
    /// returned unchanged.
    fn provision(&self, user_id: &str, limits: QuotaLimits) -> Result<UserQuota, LedgerError>;

    /// Replace both limits. Counters are untouched.
    fn set_limits(&self, user_id: &str, limits: QuotaLimits) -> Result<UserQuota, LedgerError>;

    /// Run admission against the current counters and, for an upfront cost,
    /// add it to `consumed` in the same atomic step.
    fn reserve(&self, user_id: &str, cost: &Cost) -> Result<Reservation, LedgerError>;

    /// Atomically add `units` to the matching counter.
    fn record(&self, user_id: &str, units: Units) -> Result<UserQuota, LedgerError>;

    /// Atomically subtract `units` from the matching counter, floored at zero.
    fn release(&self, user_id: &str, units: Units) -> Result<UserQuota, LedgerError>;
}

/// Run a ledger operation on the blocking thread pool.
pub async fn blocking<F, T>(ledger: &Arc<dyn QuotaLedger>, f: F) -> Result<T, LedgerError>
where
    F: FnOnce(&dyn QuotaLedger) -> Result<T, LedgerError> + Send + 'static,
    T: Send + 'static,
{
    let ledger = Arc::clone(ledger);
    tokio::task::spawn_blocking(move || f(ledger.as_ref()))
        .await
        .map_err(|e| LedgerError::Unavailable(format!("ledger task failed: {e}")))?
}

/// Handle a "user created" event: give the user a quota record with the
/// configured default limits. Safe to call more than once.
pub fn provision_user(
    ledger: &dyn QuotaLedger,
    user_id: &str,
    limits: QuotaLimits,
) -> Result<UserQuota, LedgerError> {
    let quota = ledger.provision(user_id, limits)?;
    tracing::info!(
        user_id = %user_id,
        text_unit_limit = quota.text_unit_limit,
        image_unit_limit = quota.image_unit_limit,
        "Quota provisioned"
    );
    Ok(quota)
}

/// Terminal state of a proxied request, as written to `usage_log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Denied,
    UpstreamError,
    /// Upstream succeeded but the usage was not charged: the ledger write
    /// failed or the provider sent no usage report.
    Unrecorded,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Denied => "denied",
            Self::UpstreamError => "upstream_error",
            Self::Unrecorded => "unrecorded",
        }
    }
}

/// A single request outcome to be written asynchronously by the audit logger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub user_id: String,
    pub request_id: String,
    pub provider: String,
    pub model: String,
    pub unit_kind: UnitKind,
    pub units: f64,
    pub latency_ms: u64,
    pub status: AuditStatus,
}

pub(crate) fn now_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
