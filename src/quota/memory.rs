use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::quota::admission::{Decision, admit};
use crate::quota::{
    Cost, LedgerError, QuotaLedger, QuotaLimits, Reservation, UserQuota, Units, now_timestamp,
};

/// In-process ledger for tests and ephemeral deployments.
///
/// Each operation holds the shard lock for its user's entry for the whole
/// read-check-write, which gives the same atomicity as the SQLite ledger
/// within one process. Counters are lost on restart.
#[derive(Default)]
pub struct MemoryLedger {
    quotas: DashMap<String, UserQuota>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(
        &self,
        user_id: &str,
        f: impl FnOnce(&mut UserQuota),
    ) -> Result<UserQuota, LedgerError> {
        let mut entry = self
            .quotas
            .get_mut(user_id)
            .ok_or_else(|| LedgerError::NotFound(user_id.to_string()))?;
        f(entry.value_mut());
        entry.updated_at = now_timestamp();
        Ok(entry.clone())
    }
}

impl QuotaLedger for MemoryLedger {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn get(&self, user_id: &str) -> Result<UserQuota, LedgerError> {
        self.quotas
            .get(user_id)
            .map(|q| q.clone())
            .ok_or_else(|| LedgerError::NotFound(user_id.to_string()))
    }

    fn provision(&self, user_id: &str, limits: QuotaLimits) -> Result<UserQuota, LedgerError> {
        let quota = match self.quotas.entry(user_id.to_string()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                let now = now_timestamp();
                slot.insert(UserQuota {
                    user_id: user_id.to_string(),
                    text_units_consumed: 0,
                    text_unit_limit: limits.text_unit_limit,
                    image_units_consumed: 0.0,
                    image_unit_limit: limits.image_unit_limit,
                    created_at: now.clone(),
                    updated_at: now,
                })
                .clone()
            }
        };
        Ok(quota)
    }

    fn set_limits(&self, user_id: &str, limits: QuotaLimits) -> Result<UserQuota, LedgerError> {
        self.update(user_id, |q| {
            q.text_unit_limit = limits.text_unit_limit;
            q.image_unit_limit = limits.image_unit_limit;
        })
    }

    fn reserve(&self, user_id: &str, cost: &Cost) -> Result<Reservation, LedgerError> {
        let mut entry = self
            .quotas
            .get_mut(user_id)
            .ok_or_else(|| LedgerError::NotFound(user_id.to_string()))?;

        let kind = cost.kind();
        if let Decision::Deny(exceeded) = admit(entry.consumed(kind), entry.limit(kind), cost) {
            return Ok(Reservation::Denied(exceeded));
        }

        if let Some(units) = cost.reserved() {
            add(entry.value_mut(), units);
            entry.updated_at = now_timestamp();
        }
        Ok(Reservation::Granted(entry.clone()))
    }

    fn record(&self, user_id: &str, units: Units) -> Result<UserQuota, LedgerError> {
        self.update(user_id, |q| add(q, units))
    }

    fn release(&self, user_id: &str, units: Units) -> Result<UserQuota, LedgerError> {
        self.update(user_id, |q| match units {
            Units::Text(n) => q.text_units_consumed = q.text_units_consumed.saturating_sub(n),
            Units::Image(x) => q.image_units_consumed = (q.image_units_consumed - x).max(0.0),
        })
    }
}

fn add(quota: &mut UserQuota, units: Units) {
    match units {
        Units::Text(n) => quota.text_units_consumed = quota.text_units_consumed.saturating_add(n),
        Units::Image(x) => quota.image_units_consumed += x,
    }
}
