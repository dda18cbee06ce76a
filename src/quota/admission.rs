use crate::quota::{Cost, QuotaExceeded};

/// Slack for floating-point accumulation in image counters, e.g. twenty
/// 0.2-unit requests against a limit of 4.
pub const TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allow,
    Deny(QuotaExceeded),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Decide whether a request may proceed.
///
/// An upfront cost is denied when it would take `consumed` past `limit`. A
/// deferred cost is denied only once the limit has been reached, so a single
/// text request may overshoot by whatever the provider reports.
pub fn admit(consumed: f64, limit: f64, cost: &Cost) -> Decision {
    let (over, requested) = match cost {
        Cost::Upfront(units) => {
            let requested = units.as_f64();
            (consumed + requested > limit + TOLERANCE, requested)
        }
        Cost::Deferred(_) => (consumed >= limit, 0.0),
    };

    if over {
        Decision::Deny(QuotaExceeded {
            kind: cost.kind(),
            consumed,
            limit,
            requested,
        })
    } else {
        Decision::Allow
    }
}
