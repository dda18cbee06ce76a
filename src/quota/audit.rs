use std::time::Duration;

use rusqlite::params;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::db::Database;
use crate::quota::AuditEntry;

/// Maximum number of entries to buffer before flushing, regardless of timer.
const BATCH_SIZE: usize = 100;

/// How often to flush buffered entries even if the batch is not full.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn a background task that reads `AuditEntry` values from the channel
/// and batch-writes them to the `usage_log` table.
///
/// The log is request history only. Quota counters are owned by the ledger
/// and never derived from these rows.
///
/// The task exits once every sender is dropped and the remaining entries are
/// flushed; await the returned handle for a clean shutdown.
pub fn spawn_audit_logger(
    db: Database,
    mut rx: mpsc::UnboundedReceiver<AuditEntry>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer: Vec<AuditEntry> = Vec::with_capacity(BATCH_SIZE);
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        // Don't pile up ticks while we're busy flushing.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                entry = rx.recv() => {
                    match entry {
                        Some(e) => {
                            buffer.push(e);
                            if buffer.len() >= BATCH_SIZE {
                                flush_batch(&db, &mut buffer).await;
                            }
                        }
                        None => {
                            if !buffer.is_empty() {
                                flush_batch(&db, &mut buffer).await;
                            }
                            tracing::info!("Audit logger shutting down");
                            break;
                        }
                    }
                }
                _ = interval.tick() => {
                    if !buffer.is_empty() {
                        flush_batch(&db, &mut buffer).await;
                    }
                }
            }
        }
    })
}

/// Write a batch on the blocking pool. Failed batches are kept for the next
/// tick.
async fn flush_batch(db: &Database, buffer: &mut Vec<AuditEntry>) {
    let entries = std::mem::take(buffer);
    let count = entries.len();
    let db = db.clone();

    let result = tokio::task::spawn_blocking(move || {
        let outcome = write_entries(&db, &entries);
        (entries, outcome)
    })
    .await;

    match result {
        Ok((_, Ok(()))) => tracing::debug!(count, "Flushed audit batch"),
        Ok((entries, Err(e))) => {
            tracing::error!(count, error = %e, "Failed to flush audit batch");
            buffer.extend(entries);
        }
        Err(e) => tracing::error!(count, error = %e, "Audit flush task failed"),
    }
}

fn write_entries(db: &Database, entries: &[AuditEntry]) -> Result<(), rusqlite::Error> {
    db.with_tx(|tx| {
        let mut insert_stmt = tx.prepare_cached(
            "INSERT INTO usage_log (id, user_id, request_id, provider, model, \
             unit_kind, units, latency_ms, status) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;

        for entry in entries {
            insert_stmt.execute(params![
                Uuid::new_v4().to_string(),
                entry.user_id,
                entry.request_id,
                entry.provider,
                entry.model,
                entry.unit_kind.as_str(),
                entry.units,
                i64::try_from(entry.latency_ms).unwrap_or(i64::MAX),
                entry.status.as_str(),
            ])?;
        }
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
