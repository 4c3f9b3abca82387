use anyhow::{Context, Result};

use topd_core::site::{Site, SiteId};

use crate::DuckDbBackend;

type SiteRow = (i64, i64, i64, i64, bool);

fn site_from_row((id, counter_id, visitors, hits, show_digits): SiteRow) -> Result<Site> {
    Ok(Site {
        id: SiteId::try_from(id).with_context(|| format!("site id {id} out of range"))?,
        counter_image_id: u32::try_from(counter_id)
            .with_context(|| format!("counter id {counter_id} out of range for site {id}"))?,
        hits: u64::try_from(hits).unwrap_or(0),
        unique_hosts: u64::try_from(visitors).unwrap_or(0),
        show_digits,
    })
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).context("counter exceeds BIGINT range")
}

impl DuckDbBackend {
    /// Sites with `id > since_id`, ascending.
    pub async fn populate(&self, since_id: SiteId) -> Result<Vec<Site>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, counter_id, visitors, hits, show_digits FROM top_sites \
                 WHERE id > ?1 ORDER BY id",
            )
            .context("on populate prepare")?;
        let rows = stmt
            .query_map(duckdb::params![since_id as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            })
            .context("on populate")?
            .collect::<Result<Vec<SiteRow>, _>>()
            .context("on populate scan")?;

        rows.into_iter().map(site_from_row).collect()
    }

    /// Upsert the counters of `sites` in a single transaction.
    ///
    /// Existing rows only get `visitors`/`hits` overwritten; unknown ids are
    /// inserted whole. Returns immediately (no-op) if `sites` is empty.
    pub async fn update_sites(&self, sites: &[Site]) -> Result<()> {
        if sites.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().context("on begin tx")?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO top_sites (id, counter_id, visitors, hits, show_digits) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT (id) DO UPDATE SET \
                     visitors = EXCLUDED.visitors, hits = EXCLUDED.hits",
                )
                .context("on stmt prepare")?;
            for site in sites {
                stmt.execute(duckdb::params![
                    site.id as i64,
                    site.counter_image_id as i64,
                    to_i64(site.unique_hosts)?,
                    to_i64(site.hits)?,
                    site.show_digits,
                ])
                .with_context(|| format!("on exec tx for site {}", site.id))?;
            }
        }
        tx.commit().context("on commit tx")?;
        tracing::debug!("Updated counters of {} sites", sites.len());
        Ok(())
    }

    /// Insert a site row unless one with the same id exists.
    ///
    /// Used for startup fixtures and tests. Safe to call repeatedly.
    pub async fn seed_site(&self, id: SiteId, counter_id: u32, show_digits: bool) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO top_sites (id, counter_id, visitors, hits, show_digits) \
             VALUES (?1, ?2, 0, 0, ?3) ON CONFLICT (id) DO NOTHING",
            duckdb::params![id as i64, counter_id as i64, show_digits],
        )?;
        Ok(())
    }

    /// Register a new site with the next free id and return it.
    ///
    /// Test support: site administration is not served by topd itself.
    #[doc(hidden)]
    pub async fn create_site(&self, counter_id: u32, show_digits: bool) -> Result<Site> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let next_id: i64 =
            tx.query_row("SELECT COALESCE(MAX(id), 0) + 1 FROM top_sites", [], |row| {
                row.get(0)
            })?;
        tx.execute(
            "INSERT INTO top_sites (id, counter_id, visitors, hits, show_digits) \
             VALUES (?1, ?2, 0, 0, ?3)",
            duckdb::params![next_id, counter_id as i64, show_digits],
        )?;
        tx.commit()?;

        site_from_row((next_id, counter_id as i64, 0, 0, show_digits))
    }
}
