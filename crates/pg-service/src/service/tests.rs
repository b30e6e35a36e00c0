use super::*;
use crate::mock::{MockEvent, MockPool, MockResponse};
use pg_sql::{SqlValue, join_values, sql};
use std::time::Duration;

fn service(pool: &MockPool) -> PgService<MockPool> {
    PgService::new(pool.clone(), Decoders::default())
}

#[tokio::test]
async fn query_returns_rows_and_releases() {
    let pool = MockPool::new();
    pool.on(
        "FROM users",
        MockResponse::rows(&["id", "name"], vec![vec![SqlValue::Int(1), SqlValue::Text("paul".into())]]),
    );

    let result = service(&pool)
        .query(sql!("SELECT id, name FROM users WHERE id=" {1}))
        .await
        .unwrap();

    assert_eq!(result.get(0, "name"), Some(&SqlValue::Text("paul".into())));
    assert_eq!(pool.acquired(), 1);
    assert_eq!(pool.released(), 1);
    assert_eq!(
        pool.events()[1],
        MockEvent::Execute {
            text: "SELECT id, name FROM users WHERE id=$1".into(),
            values: vec![SqlValue::Int(1)],
        }
    );
}

#[tokio::test]
async fn query_failure_is_a_batch_of_one() {
    let pool = MockPool::new();
    pool.on("INSERT", MockResponse::error("23505", "duplicate key value"));
    let service = service(&pool);
    let insert = || sql!("INSERT INTO users (id, type) VALUES (" {1} ", " {"admin"} ")");

    let single = service.query(insert()).await.unwrap_err();
    let batch = service.queries([insert()]).await.unwrap_err();

    assert_eq!(single.kind(), "E_PG_QUERIES");
    assert_eq!(single.kind(), batch.kind());
    assert_eq!(single.params(), batch.params());
    assert!(single.is_unique_violation());
    let params = single.params();
    assert_eq!(
        params[0],
        serde_json::json!(["INSERT INTO users (id, type) VALUES ($1, $2)"])
    );
    assert_eq!(params[1], serde_json::json!([[1, "admin"]]));
    assert_eq!(params[2]["index"], 0);
    assert_eq!(params[2]["code"], "23505");
    assert_eq!(pool.released(), 2);
}

#[tokio::test]
async fn misaligned_statement_fails_fast() {
    let pool = MockPool::new();
    let err = service(&pool)
        .query(pg_sql::Query {
            text: "SELECT * FROM users WHERE id = $1 AND type = $2".into(),
            values: vec![SqlValue::Int(1)],
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "E_PG_QUERIES");
    assert!(err.to_string().contains("$2"));
    assert_eq!(err.params()[2]["index"], 0);
    assert!(pool.completions().is_empty());
}

#[tokio::test]
async fn queries_share_one_connection() {
    let pool = MockPool::new();
    pool.on("count", MockResponse::rows(&["count"], vec![vec![SqlValue::Int(2)]]));

    let results = service(&pool)
        .queries([
            sql!("SELECT count(*) FROM users"),
            sql!("SELECT * FROM users WHERE id IN (" {join_values([1, 2])} ")"),
        ])
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].rows, vec![vec![SqlValue::Int(2)]]);
    assert!(results[1].is_empty());
    assert_eq!(pool.acquired(), 1);
    assert_eq!(pool.released(), 1);
}

#[tokio::test(start_paused = true)]
async fn queries_keep_input_order_when_completing_in_reverse() {
    let pool = MockPool::new();
    pool.on_after("slow", MockResponse::rows(&["v"], vec![vec![SqlValue::Text("slow".into())]]), Duration::from_millis(300))
        .on_after("medium", MockResponse::rows(&["v"], vec![vec![SqlValue::Text("medium".into())]]), Duration::from_millis(200))
        .on_after("fast", MockResponse::rows(&["v"], vec![vec![SqlValue::Text("fast".into())]]), Duration::from_millis(100));

    let results = service(&pool)
        .queries([
            sql!("SELECT 'slow'"),
            sql!("SELECT 'medium'"),
            sql!("SELECT 'fast'"),
        ])
        .await
        .unwrap();

    assert_eq!(
        pool.completions(),
        ["SELECT 'fast'", "SELECT 'medium'", "SELECT 'slow'"]
    );
    let firsts: Vec<_> = results.iter().map(|r| r.rows[0][0].clone()).collect();
    assert_eq!(
        firsts,
        [
            SqlValue::Text("slow".into()),
            SqlValue::Text("medium".into()),
            SqlValue::Text("fast".into()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn queries_report_the_lowest_failing_index() {
    let pool = MockPool::new();
    pool.on_after("second", MockResponse::error("22P02", "invalid input"), Duration::from_millis(50))
        .on("third", MockResponse::error("42703", "column does not exist"));

    let err = service(&pool)
        .queries([
            sql!("SELECT 'first'"),
            sql!("SELECT 'second', " {1}),
            sql!("SELECT 'third'"),
        ])
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "E_PG_QUERIES");
    let params = err.params();
    assert_eq!(
        params[0],
        serde_json::json!(["SELECT 'first'", "SELECT 'second', $1", "SELECT 'third'"])
    );
    assert_eq!(params[1], serde_json::json!([[], [1], []]));
    assert_eq!(params[2]["index"], 1);
    assert_eq!(params[2]["code"], "22P02");
    // Every statement ran to completion.
    assert_eq!(pool.completions().len(), 3);
    assert_eq!(pool.released(), 1);
}

#[tokio::test]
async fn transaction_commits() {
    let pool = MockPool::new();
    pool.on("UPDATE", MockResponse::affected(1));

    let results = service(&pool)
        .transaction([
            sql!("UPDATE accounts SET balance = balance - " {10} " WHERE id=" {1}),
            sql!("UPDATE accounts SET balance = balance + " {10} " WHERE id=" {2}),
        ])
        .await
        .unwrap();

    assert_eq!(results.iter().map(|r| r.row_count).collect::<Vec<_>>(), [1, 1]);
    let statements = pool.statements();
    assert_eq!(statements.first().map(String::as_str), Some("BEGIN"));
    assert_eq!(statements.last().map(String::as_str), Some("COMMIT"));
    assert_eq!(pool.released(), 1);
    assert_eq!(pool.detached(), 0);
}

#[tokio::test]
async fn failing_transaction_rolls_back() {
    let pool = MockPool::new();
    pool.on("broken", MockResponse::error("23503", "violates foreign key constraint"));

    let err = service(&pool)
        .transaction([
            sql!("INSERT INTO a VALUES (" {1} ")"),
            sql!("INSERT INTO broken VALUES (" {2} ")"),
            sql!("INSERT INTO c VALUES (" {3} ")"),
        ])
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "E_PG_TRANSACTION");
    assert!(err.is_foreign_key_violation());
    assert_eq!(err.params()[2]["index"], 1);

    let statements = pool.statements();
    assert_eq!(statements.first().map(String::as_str), Some("BEGIN"));
    assert_eq!(statements.last().map(String::as_str), Some("ROLLBACK"));
    assert!(!statements.iter().any(|s| s == "COMMIT"));
    assert_eq!(pool.acquired(), 1);
    assert_eq!(pool.released(), 1);
    assert_eq!(pool.detached(), 0);
    assert_eq!(pool.events().last(), Some(&MockEvent::Release));
}

#[tokio::test]
async fn failed_rollback_is_attached_and_connection_discarded() {
    let pool = MockPool::new();
    pool.on("broken", MockResponse::error("40001", "could not serialize access"))
        .on("ROLLBACK", MockResponse::error("08006", "connection failure"));

    let err = service(&pool)
        .transaction([sql!("UPDATE broken SET x = " {1})])
        .await
        .unwrap_err();

    let PgError::Transaction(failure) = &err else {
        panic!("expected a transaction error, got {err:?}");
    };
    assert_eq!(failure.error.message(), "could not serialize access");
    assert_eq!(
        failure.rollback_error.as_ref().and_then(DriverError::code),
        Some("08006")
    );
    assert!(err.is_serialization_failure());
    assert_eq!(pool.released(), 0);
    assert_eq!(pool.detached(), 1);
}

#[tokio::test]
async fn failed_begin_has_no_index() {
    let pool = MockPool::new();
    pool.on("BEGIN", MockResponse::error("25001", "already in a transaction"));

    let err = service(&pool)
        .transaction([sql!("SELECT 1")])
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "E_PG_TRANSACTION");
    assert_eq!(err.params()[2]["index"], serde_json::Value::Null);
    assert_eq!(pool.statements(), ["BEGIN"]);
}

#[tokio::test(start_paused = true)]
async fn cancelled_transaction_detaches_its_connection() {
    let pool = MockPool::new();
    pool.on_after("pg_sleep", MockResponse::affected(0), Duration::from_secs(10));
    let service = service(&pool);

    let cancelled = tokio::time::timeout(
        Duration::from_millis(10),
        service.transaction([sql!("SELECT pg_sleep(" {10} ")")]),
    )
    .await;

    assert!(cancelled.is_err());
    assert_eq!(pool.detached(), 1);
    assert_eq!(pool.released(), 0);
}

#[tokio::test]
async fn lease_gives_back_or_detaches_exactly_once() {
    let pool = MockPool::new();

    drop(Lease::new(pool.acquire().await.unwrap()));
    let mut open = Lease::new(pool.acquire().await.unwrap());
    open.in_transaction = true;
    drop(open);

    assert_eq!(pool.acquired(), 2);
    assert_eq!(pool.released(), 1);
    assert_eq!(pool.detached(), 1);
    assert_eq!(
        pool.events(),
        [
            MockEvent::Acquire,
            MockEvent::Release,
            MockEvent::Acquire,
            MockEvent::Detach,
        ]
    );
}

#[tokio::test]
async fn acquisition_failure_is_a_pool_error() {
    let pool = MockPool::new();
    pool.fail_acquire("timed out waiting for a connection");

    let err = service(&pool).query(sql!("SELECT 1")).await.unwrap_err();
    assert_eq!(err.kind(), "E_PG_POOL");
    assert_eq!(pool.acquired(), 0);
}

#[tokio::test]
async fn dispose_is_idempotent_and_refuses_new_calls() {
    let pool = MockPool::new();
    let service = service(&pool);

    service.dispose().await;
    service.dispose().await;

    assert!(pool.is_closed());
    assert!(service.is_disposed());
    let err = service.query(sql!("SELECT 1")).await.unwrap_err();
    assert!(err.is_closed());
    assert_eq!(pool.acquired(), 0);
}

#[tokio::test(start_paused = true)]
async fn dispose_waits_for_running_calls() {
    let pool = MockPool::new();
    pool.on_after("slow", MockResponse::affected(1), Duration::from_millis(500));
    let service = service(&pool);

    let running = tokio::spawn({
        let service = service.clone();
        async move { service.query(sql!("UPDATE slow SET x = " {1})).await }
    });
    tokio::task::yield_now().await;
    assert_eq!(pool.acquired(), 1);

    service.dispose().await;

    assert!(pool.is_closed());
    assert_eq!(pool.released(), 1);
    let result = running.await.unwrap().unwrap();
    assert_eq!(result.row_count, 1);
}

#[tokio::test]
async fn provider_exposes_background_failures() {
    let pool = MockPool::new();
    let provider = PgProvider::from_pool(pool.clone(), Decoders::default());

    pool.fail_connection(DriverError::new("terminating connection due to administrator command").with_code("57P01"));

    let err = provider.failures.wait().await;
    assert_eq!(err.kind(), "E_PG_CONNECTION");
    assert_eq!(err.code(), Some("57P01"));
    assert!(provider.service.failures().current().is_some());

    provider.dispose().await;
    assert!(pool.is_closed());
}

#[test]
fn init_reads_the_url_from_the_environment() {
    let env: std::collections::HashMap<String, String> =
        [("APP_DB".to_owned(), "postgres://app@localhost:5439/app".to_owned())].into();

    let provider = PgProvider::init(
        PgServiceDeps::new(PgConfig::default().max_size(2), env).url_env_name("APP_DB"),
    )
    .unwrap();
    assert!(!provider.service.is_disposed());
}

#[test]
fn init_rejects_a_malformed_url() {
    let env: std::collections::HashMap<String, String> =
        [("PG_URL".to_owned(), "postgres://localhost:notaport/app".to_owned())].into();

    let err = PgProvider::init(PgServiceDeps::new(PgConfig::default(), env)).unwrap_err();
    assert_eq!(err.kind(), "E_PG_CONFIG");
}
