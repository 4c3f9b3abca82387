use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use topd_core::config::{Config, StorageKind};
use topd_duckdb::DuckDbBackend;
use topd_server::app::build_app;
use topd_server::bot_detection::BotList;
use topd_server::keeper::{ControlEvent, StopReason};
use topd_server::state::AppState;
use topd_storage::PersistenceBackend;

fn test_config() -> Config {
    Config {
        port: 0,
        socket: None,
        data_dir: "/tmp/topd-test".to_string(),
        storage: StorageKind::DuckDb,
        duckdb_memory_limit: "1GB".to_string(),
        host: "counter.test".to_string(),
        cookie_domain: "counter.test".to_string(),
        bots_path: "/nonexistent/bots.txt".to_string(),
        timezone: chrono_tz::UTC,
        // Long enough that only control events flush during a test.
        flush_interval_secs: 3600,
        history_queue_capacity: 16,
    }
}

fn visit_request(site_id: u32, session: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(format!("/top/?id={site_id}&p=%2Fnews"))
        .header(header::USER_AGENT, "Mozilla/5.0")
        .header(header::COOKIE, format!("sess={session}"))
        .header("X-Real-IP", "198.51.100.4")
        .header("X-Geo", "DE:42")
        .body(Body::empty())
        .expect("build request")
}

async fn wait_for_history(state: &AppState, len: usize) {
    for _ in 0..200 {
        if state.history.len().await >= len {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("history never reached {len} records");
}

async fn count_rows(db: &DuckDbBackend) -> i64 {
    let conn = db.conn_for_test().await;
    conn.query_row("SELECT COUNT(*) FROM top_data", [], |row| row.get(0))
        .expect("count rows")
}

async fn stored_counters(db: &DuckDbBackend, site_id: i64) -> (i64, i64) {
    let conn = db.conn_for_test().await;
    conn.query_row(
        "SELECT hits, visitors FROM top_sites WHERE id = ?1",
        topd_duckdb::duckdb::params![site_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .expect("site row")
}

// ============================================================
// BDD: Reload persists the period, then counting starts over;
//      terminate persists the rest and signals done once.
// ============================================================
#[tokio::test]
async fn test_reload_then_terminate_persists_everything() {
    let db = Arc::new(DuckDbBackend::open_in_memory().expect("in-memory DuckDB"));
    db.seed_site(1, 1, true).await.expect("seed site");
    let backend: Arc<dyn PersistenceBackend> = db.clone();

    let state = Arc::new(AppState::new(backend, test_config(), BotList::default()));
    let cancel = CancellationToken::new();
    let consumer = state.start(cancel.clone()).await.expect("start state");
    let app = build_app(Arc::clone(&state));

    let (control_tx, control_rx) = mpsc::channel(4);
    let (done_tx, done_rx) = oneshot::channel();
    let keeper = tokio::spawn(state.keeper().run(cancel.clone(), control_rx, done_tx));

    for session in ["a", "a", "b"] {
        let response = app
            .clone()
            .oneshot(visit_request(1, session))
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::OK);
    }
    wait_for_history(&state, 3).await;

    control_tx
        .send(ControlEvent::Reload)
        .await
        .expect("send reload");
    for _ in 0..200 {
        // Sessions are reset last, so an empty set means the reload finished.
        if count_rows(&db).await == 3 && state.sessions.sessions_for(1) == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(count_rows(&db).await, 3);
    assert_eq!(stored_counters(&db, 1).await, (3, 2));

    // Session "a" is new again after the reload.
    app.clone()
        .oneshot(visit_request(1, "a"))
        .await
        .expect("request");
    wait_for_history(&state, 1).await;
    let site = state.sites.get(1).expect("site 1");
    assert_eq!((site.hits, site.unique_hosts), (1, 1));

    control_tx
        .send(ControlEvent::Terminate)
        .await
        .expect("send terminate");
    done_rx.await.expect("done signalled");
    assert_eq!(keeper.await.expect("keeper task"), StopReason::Terminated);

    assert_eq!(count_rows(&db).await, 4);
    assert_eq!(stored_counters(&db, 1).await, (1, 1));

    let conn = db.conn_for_test().await;
    let (country, city): (String, i32) = conn
        .query_row(
            "SELECT country, city FROM top_data LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .expect("history row");
    assert_eq!((country.as_str(), city), ("DE", 42));
    drop(conn);

    cancel.cancel();
    consumer.await.expect("consumer task");
}

// ============================================================
// BDD: Cancellation stops the keeper without a flush
// ============================================================
#[tokio::test]
async fn test_cancel_stops_keeper_without_flush() {
    let db = Arc::new(DuckDbBackend::open_in_memory().expect("in-memory DuckDB"));
    db.seed_site(1, 1, true).await.expect("seed site");
    let backend: Arc<dyn PersistenceBackend> = db.clone();

    let state = Arc::new(AppState::new(backend, test_config(), BotList::default()));
    let cancel = CancellationToken::new();
    let consumer = state.start(cancel.clone()).await.expect("start state");
    let app = build_app(Arc::clone(&state));

    let (_control_tx, control_rx) = mpsc::channel(4);
    let (done_tx, done_rx) = oneshot::channel();
    let keeper = tokio::spawn(state.keeper().run(cancel.clone(), control_rx, done_tx));

    app.oneshot(visit_request(1, "a")).await.expect("request");
    wait_for_history(&state, 1).await;

    cancel.cancel();
    assert_eq!(keeper.await.expect("keeper task"), StopReason::Cancelled);
    consumer.await.expect("consumer task");

    assert!(done_rx.await.is_err());
    assert_eq!(count_rows(&db).await, 0);
    assert_eq!(state.history.len().await, 1);
}
