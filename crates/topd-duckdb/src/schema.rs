/// DuckDB initialization SQL.
///
/// Executed once at database open time via `Connection::execute_batch`.
/// All statements use `IF NOT EXISTS` so they are safe to re-run on every
/// startup.
///
/// `memory_limit` comes from `Config.duckdb_memory_limit`
/// (env `TOPD_DUCKDB_MEMORY`, default `"1GB"`). Always set an explicit limit:
/// the DuckDB default (80% of system RAM) is not acceptable for a server
/// process.
pub fn init_sql(memory_limit: &str) -> String {
    format!(
        r#"SET memory_limit = '{memory_limit}';
SET threads = 2;

-- ===========================================
-- SITES (one row per tracked property)
-- ===========================================
-- visitors/hits hold the counters of the current period; the server
-- overwrites them on every flush and zeroes them on reload.
CREATE TABLE IF NOT EXISTS top_sites (
    id              INTEGER PRIMARY KEY,
    counter_id      INTEGER NOT NULL DEFAULT 1,
    visitors        BIGINT NOT NULL DEFAULT 0,
    hits            BIGINT NOT NULL DEFAULT 0,
    show_digits     BOOLEAN NOT NULL DEFAULT TRUE
);

-- ===========================================
-- VISIT HISTORY (append-only)
-- ===========================================
-- `day` is TO_DAYS(date) in the configured timezone so per-day reports
-- can group without timezone arithmetic.
CREATE TABLE IF NOT EXISTS top_data (
    user_id         INTEGER NOT NULL,
    sess_id         VARCHAR NOT NULL,
    page            VARCHAR NOT NULL,
    referrer        VARCHAR NOT NULL,
    date            TIMESTAMP NOT NULL,
    day             BIGINT NOT NULL,
    ua              VARCHAR NOT NULL,
    ip              VARCHAR NOT NULL,
    city            INTEGER NOT NULL DEFAULT 0,
    country         VARCHAR(8) NOT NULL DEFAULT '0'
);
CREATE INDEX IF NOT EXISTS idx_top_data_user_day ON top_data(user_id, day);
"#
    )
}
