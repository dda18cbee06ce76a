use std::sync::Arc;

use crate::quota::admission::TOLERANCE;
use crate::quota::{Cost, LedgerError, QuotaLedger, UserQuota, Units, blocking};

/// Result of settling a request against the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    /// What the request was finally charged.
    pub charged: Units,
    /// Counters after the charge.
    pub quota: UserQuota,
    /// The provider gave no usable report for a deferred cost, so nothing
    /// was charged.
    pub unmetered: bool,
}

/// Applies usage to the ledger after a request has been dispatched.
#[derive(Clone)]
pub struct UsageRecorder {
    ledger: Arc<dyn QuotaLedger>,
}

impl UsageRecorder {
    pub fn new(ledger: Arc<dyn QuotaLedger>) -> Self {
        Self { ledger }
    }

    /// Give back a reservation taken at admission.
    pub async fn release(&self, user_id: &str, units: Units) -> Result<UserQuota, LedgerError> {
        let user_id = user_id.to_string();
        blocking(&self.ledger, move |l| l.release(&user_id, units)).await
    }

    /// Charge a completed request.
    ///
    /// `granted` is the quota returned by the reservation. Provider-reported
    /// usage wins over the admission estimate: for an upfront cost only the
    /// difference from the reservation is written, for a deferred cost the
    /// full reported amount is added. An upfront cost with no report needs no
    /// write at all.
    pub async fn settle(
        &self,
        granted: UserQuota,
        cost: Cost,
        actual: Option<Units>,
    ) -> Result<Settlement, LedgerError> {
        blocking(&self.ledger, move |ledger| {
            settle_blocking(ledger, granted, cost, actual)
        })
        .await
    }
}

fn settle_blocking(
    ledger: &dyn QuotaLedger,
    granted: UserQuota,
    cost: Cost,
    actual: Option<Units>,
) -> Result<Settlement, LedgerError> {
    let user_id = granted.user_id.clone();
    let user_id = user_id.as_str();
    let actual = actual.filter(|units| {
        let matches = units.kind() == cost.kind();
        if !matches {
            tracing::warn!(
                user_id = %user_id,
                expected = %cost.kind(),
                reported = %units.kind(),
                "Provider reported usage in the wrong unit, ignoring"
            );
        }
        matches
    });

    match (cost, actual) {
        (Cost::Upfront(reserved), None) => Ok(Settlement {
            charged: reserved,
            quota: granted,
            unmetered: false,
        }),
        (Cost::Upfront(reserved), Some(actual)) => {
            let quota = match adjustment(reserved, actual) {
                Adjustment::Charge(extra) => ledger.record(user_id, extra)?,
                Adjustment::Refund(excess) => ledger.release(user_id, excess)?,
                Adjustment::None => granted,
            };
            Ok(Settlement {
                charged: actual,
                quota,
                unmetered: false,
            })
        }
        (Cost::Deferred(_), Some(actual)) => Ok(Settlement {
            charged: actual,
            quota: ledger.record(user_id, actual)?,
            unmetered: false,
        }),
        (Cost::Deferred(kind), None) => Ok(Settlement {
            charged: Units::zero(kind),
            quota: granted,
            unmetered: true,
        }),
    }
}

#[derive(Debug, PartialEq)]
enum Adjustment {
    Charge(Units),
    Refund(Units),
    None,
}

/// Difference between a reservation and the reported usage, both of the same
/// unit kind.
fn adjustment(reserved: Units, actual: Units) -> Adjustment {
    match (reserved, actual) {
        (Units::Text(r), Units::Text(a)) if a > r => Adjustment::Charge(Units::Text(a - r)),
        (Units::Text(r), Units::Text(a)) if a < r => Adjustment::Refund(Units::Text(r - a)),
        (Units::Image(r), Units::Image(a)) if (a - r).abs() <= TOLERANCE => Adjustment::None,
        (Units::Image(r), Units::Image(a)) if a > r => Adjustment::Charge(Units::Image(a - r)),
        (Units::Image(r), Units::Image(a)) => Adjustment::Refund(Units::Image(r - a)),
        _ => Adjustment::None,
    }
}
