use rusqlite::{OptionalExtension, Transaction, params};

use crate::db::Database;
use crate::quota::admission::{Decision, admit};
use crate::quota::{Cost, LedgerError, QuotaLedger, QuotaLimits, Reservation, UserQuota, Units};

const SELECT_QUOTA: &str = "SELECT user_id, text_units_consumed, text_unit_limit, \
     image_units_consumed, image_unit_limit, created_at, updated_at \
     FROM quotas WHERE user_id = ?1";

/// Durable ledger backed by the `quotas` table.
///
/// Every operation runs in an `IMMEDIATE` transaction and changes counters
/// with a single relative `UPDATE`, so concurrent requests from the same user
/// (or from another process sharing the file) serialize on the write lock.
pub struct SqliteLedger {
    db: Database,
}

impl SqliteLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl QuotaLedger for SqliteLedger {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn get(&self, user_id: &str) -> Result<UserQuota, LedgerError> {
        self.db
            .with_conn(|conn| conn.query_row(SELECT_QUOTA, params![user_id], row_to_quota).optional())?
            .ok_or_else(|| LedgerError::NotFound(user_id.to_string()))
    }

    fn provision(&self, user_id: &str, limits: QuotaLimits) -> Result<UserQuota, LedgerError> {
        let quota = self.db.with_tx(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO quotas (user_id, text_unit_limit, image_unit_limit) \
                 VALUES (?1, ?2, ?3)",
                params![user_id, to_i64(limits.text_unit_limit), limits.image_unit_limit],
            )?;
            load(tx, user_id)
        })?;
        quota.ok_or_else(|| LedgerError::NotFound(user_id.to_string()))
    }

    fn set_limits(&self, user_id: &str, limits: QuotaLimits) -> Result<UserQuota, LedgerError> {
        let quota = self.db.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE quotas SET text_unit_limit = ?2, image_unit_limit = ?3, \
                 updated_at = datetime('now') WHERE user_id = ?1",
                params![user_id, to_i64(limits.text_unit_limit), limits.image_unit_limit],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            load(tx, user_id)
        })?;

        let quota = quota.ok_or_else(|| LedgerError::NotFound(user_id.to_string()))?;
        tracing::info!(
            user_id = %user_id,
            text_unit_limit = quota.text_unit_limit,
            image_unit_limit = quota.image_unit_limit,
            "Quota limits set"
        );
        Ok(quota)
    }

    fn reserve(&self, user_id: &str, cost: &Cost) -> Result<Reservation, LedgerError> {
        let outcome = self.db.with_tx(|tx| {
            let Some(quota) = load(tx, user_id)? else {
                return Ok(None);
            };

            let kind = cost.kind();
            if let Decision::Deny(exceeded) = admit(quota.consumed(kind), quota.limit(kind), cost)
            {
                return Ok(Some(Reservation::Denied(exceeded)));
            }

            match cost.reserved() {
                Some(units) => {
                    apply_delta(tx, user_id, units, Direction::Add)?;
                    let updated = load(tx, user_id)?.unwrap_or(quota);
                    Ok(Some(Reservation::Granted(updated)))
                }
                None => Ok(Some(Reservation::Granted(quota))),
            }
        })?;

        outcome.ok_or_else(|| LedgerError::NotFound(user_id.to_string()))
    }

    fn record(&self, user_id: &str, units: Units) -> Result<UserQuota, LedgerError> {
        self.update(user_id, units, Direction::Add)
    }

    fn release(&self, user_id: &str, units: Units) -> Result<UserQuota, LedgerError> {
        self.update(user_id, units, Direction::Subtract)
    }
}

impl SqliteLedger {
    fn update(
        &self,
        user_id: &str,
        units: Units,
        direction: Direction,
    ) -> Result<UserQuota, LedgerError> {
        let quota = self.db.with_tx(|tx| {
            if apply_delta(tx, user_id, units, direction)? == 0 {
                return Ok(None);
            }
            load(tx, user_id)
        })?;
        quota.ok_or_else(|| LedgerError::NotFound(user_id.to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Add,
    Subtract,
}

/// Relative counter update; returns the number of rows changed.
fn apply_delta(
    tx: &Transaction<'_>,
    user_id: &str,
    units: Units,
    direction: Direction,
) -> Result<usize, rusqlite::Error> {
    let sql = match (units, direction) {
        (Units::Text(_), Direction::Add) => {
            "UPDATE quotas SET text_units_consumed = text_units_consumed + ?2, \
             updated_at = datetime('now') WHERE user_id = ?1"
        }
        (Units::Text(_), Direction::Subtract) => {
            "UPDATE quotas SET text_units_consumed = MAX(text_units_consumed - ?2, 0), \
             updated_at = datetime('now') WHERE user_id = ?1"
        }
        (Units::Image(_), Direction::Add) => {
            "UPDATE quotas SET image_units_consumed = image_units_consumed + ?2, \
             updated_at = datetime('now') WHERE user_id = ?1"
        }
        (Units::Image(_), Direction::Subtract) => {
            "UPDATE quotas SET image_units_consumed = MAX(image_units_consumed - ?2, 0.0), \
             updated_at = datetime('now') WHERE user_id = ?1"
        }
    };

    match units {
        Units::Text(n) => tx.execute(sql, params![user_id, to_i64(n)]),
        Units::Image(x) => tx.execute(sql, params![user_id, x]),
    }
}

fn load(tx: &Transaction<'_>, user_id: &str) -> Result<Option<UserQuota>, rusqlite::Error> {
    tx.query_row(SELECT_QUOTA, params![user_id], row_to_quota)
        .optional()
}

fn row_to_quota(row: &rusqlite::Row<'_>) -> Result<UserQuota, rusqlite::Error> {
    Ok(UserQuota {
        user_id: row.get(0)?,
        text_units_consumed: to_u64(row.get(1)?),
        text_unit_limit: to_u64(row.get(2)?),
        image_units_consumed: row.get(3)?,
        image_unit_limit: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
