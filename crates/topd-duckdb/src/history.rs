use anyhow::{Context, Result};

use topd_core::history::HistoryRecord;

use crate::DuckDbBackend;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

impl DuckDbBackend {
    /// Append a batch of history records in a single transaction.
    ///
    /// Called by the keeper on every flush. Returns immediately (no-op) if
    /// `records` is empty. A failure rolls the whole batch back.
    pub async fn save_data(&self, records: &[HistoryRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().await;

        // One transaction per batch: atomic, and one fsync instead of N.
        let tx = conn.transaction().context("on begin tx")?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO top_data \
                     (user_id, sess_id, page, referrer, date, day, ua, ip, city, country) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                )
                .context("on stmt prepare")?;

            for record in records {
                stmt.execute(duckdb::params![
                    record.site_id as i64,
                    record.session_token,
                    record.page,
                    record.referrer,
                    record.captured_at.format(TIMESTAMP_FORMAT).to_string(),
                    record.day(self.timezone),
                    record.user_agent,
                    record
                        .source_ip
                        .map(|ip| ip.to_string())
                        .unwrap_or_default(),
                    // Out-of-range ids would abort the whole batch.
                    i32::try_from(record.city_id).unwrap_or(0),
                    record.country_code,
                ])
                .context("on exec tx")?;
            }
        }
        tx.commit().context("on commit tx")?;

        tracing::info!("Inserted {} history records into DuckDB", records.len());
        Ok(())
    }
}
