//! Integration tests for PostgresBackend
//!
//! These tests require the test PostgreSQL database to be running.
//! Start it with: docker-compose -f docker-compose.test.yml up -d
//!
//! Each test works on its own freshly created table and skips itself when
//! the database is unreachable.

use crate::common::record;
use entityproxy::config::ConnectionConfig;
use entityproxy::config::connections::SslMode;
use entityproxy::config::settings::PoolSettings;
use entityproxy::db::query::{Filter, ListQuery, Page, SortSpec};
use entityproxy::db::{
    CoercionRules, EntityBackend, GuardedUpdate, PoolManager, PostgresBackend, SchemaCache,
};
use entityproxy::error::DbError;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Get test database connection config
fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        name: "integration-test".to_string(),
        host: std::env::var("TEST_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: std::env::var("TEST_DB_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(5433),
        database: std::env::var("TEST_DB_NAME").unwrap_or_else(|_| "test_db".to_string()),
        username: std::env::var("TEST_DB_USER").unwrap_or_else(|_| "test_user".to_string()),
        password: Some(
            std::env::var("TEST_DB_PASSWORD").unwrap_or_else(|_| "test_password".to_string()),
        ),
        ssl_mode: SslMode::Disable,
    }
}

/// Unique table name per test and process
fn table_name(prefix: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "it_{}_{}_{}",
        prefix,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

/// A backend over the test database, or `None` when it is unreachable
async fn connect() -> Option<(PostgresBackend, deadpool_postgres::Pool)> {
    let config = test_config();
    // One connection, so every statement in a test reuses the same session
    let pools = PoolManager::new(PoolSettings {
        max_size: 1,
        ..PoolSettings::default()
    });
    let (key, pool) = pools.pool(&config).ok()?;
    if let Err(e) = pool.get().await {
        eprintln!(
            "Skipping test: Database not available at {}:{} - {}",
            config.host, config.port, e
        );
        return None;
    }
    let rules = CoercionRules::new(["settings"], ["is_active"]);
    let backend = PostgresBackend::new(
        pool.clone(),
        key,
        Arc::new(SchemaCache::new()),
        Arc::new(rules),
    );
    Some((backend, pool))
}

async fn create_table(pool: &deadpool_postgres::Pool, table: &str) {
    let client = pool.get().await.unwrap();
    client
        .batch_execute(&format!(
            r#"CREATE TABLE "{}" (
                id text PRIMARY KEY,
                name text,
                position integer,
                hours numeric,
                is_active text,
                settings text,
                payload jsonb,
                created_date timestamp,
                updated_date timestamp,
                created_by text
            )"#,
            table
        ))
        .await
        .unwrap();
}

async fn drop_table(pool: &deadpool_postgres::Pool, table: &str) {
    if let Ok(client) = pool.get().await {
        let _ = client
            .batch_execute(&format!(r#"DROP TABLE IF EXISTS "{}""#, table))
            .await;
    }
}

fn ids(rows: &[entityproxy::db::Record]) -> Vec<Value> {
    rows.iter().map(|r| r["id"].clone()).collect()
}

#[tokio::test]
async fn test_missing_table_reads_as_empty() {
    let Some((backend, _)) = connect().await else {
        return;
    };
    let table = table_name("absent");

    let rows = backend.list(&table, &ListQuery::default()).await.unwrap();
    assert!(rows.is_empty());
    assert_eq!(backend.get(&table, "x").await.unwrap(), None);

    let err = backend
        .create(&table, record(json!({"name": "A"})), "it@example.org")
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput(_)));
}

#[tokio::test]
async fn test_create_get_update_delete() {
    let Some((backend, pool)) = connect().await else {
        return;
    };
    let table = table_name("crud");
    create_table(&pool, &table).await;

    let created = backend
        .create(
            &table,
            record(json!({"name": "Ada", "position": 3, "hours": 7.5, "nickname": "dropped"})),
            "it@example.org",
        )
        .await
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    assert!(!id.is_empty());
    assert_eq!(created["name"], json!("Ada"));
    assert_eq!(created["position"], json!(3));
    assert_eq!(created["hours"], json!(7.5));
    assert_eq!(created["created_by"], json!("it@example.org"));
    assert_eq!(created["created_date"], created["updated_date"]);
    assert!(created.get("nickname").is_none());

    let fetched = backend.get(&table, &id).await.unwrap().unwrap();
    assert_eq!(fetched, created);

    let updated = backend
        .update(
            &table,
            &id,
            record(json!({"name": "Ada L.", "created_by": "forged", "nickname": "x"})),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated["name"], json!("Ada L."));
    assert_eq!(updated["created_by"], json!("it@example.org"));

    // Nothing writable left: the current row comes back unchanged
    let unchanged = backend
        .update(&table, &id, record(json!({"nickname": "x"})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unchanged["name"], json!("Ada L."));

    assert_eq!(
        backend
            .update(&table, "ghost", record(json!({"name": "x"})))
            .await
            .unwrap(),
        None
    );

    backend.delete(&table, &id).await.unwrap();
    backend.delete(&table, &id).await.unwrap();
    assert_eq!(backend.get(&table, &id).await.unwrap(), None);

    drop_table(&pool, &table).await;
}

#[tokio::test]
async fn test_guarded_update() {
    let Some((backend, pool)) = connect().await else {
        return;
    };
    let table = table_name("guard");
    create_table(&pool, &table).await;

    let created = backend
        .create(&table, record(json!({"name": "A"})), "it@example.org")
        .await
        .unwrap();
    let id = created["id"].as_str().unwrap();
    let token = created["updated_date"].clone();

    let first = backend
        .update_guarded(&table, id, record(json!({"name": "B"})), &token)
        .await
        .unwrap();
    let GuardedUpdate::Applied(applied) = first else {
        panic!("expected applied update, got {:?}", first);
    };
    assert_eq!(applied["name"], json!("B"));

    // Move the clock past the creation millisecond
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    backend
        .update(&table, id, record(json!({"name": "C"})))
        .await
        .unwrap();

    let second = backend
        .update_guarded(&table, id, record(json!({"name": "D"})), &token)
        .await
        .unwrap();
    let GuardedUpdate::Stale(current) = second else {
        panic!("expected stale token, got {:?}", second);
    };
    assert_eq!(current["name"], json!("C"));

    let missing = backend
        .update_guarded(&table, "ghost", record(json!({"name": "D"})), &token)
        .await
        .unwrap();
    assert_eq!(missing, GuardedUpdate::Missing);

    drop_table(&pool, &table).await;
}

#[tokio::test]
async fn test_list_filter_sort_and_page() {
    let Some((backend, pool)) = connect().await else {
        return;
    };
    let table = table_name("list");
    create_table(&pool, &table).await;

    let rows = ["c", "a", "b", "d"]
        .iter()
        .zip([2, 1, 1, 5])
        .map(|(id, position)| record(json!({"id": id, "position": position})))
        .collect();
    backend
        .bulk_create(&table, rows, "it@example.org")
        .await
        .unwrap();

    let query = ListQuery {
        filter: Filter::from_json(Some(&json!({"position": {"$gte": 1, "$lte": 2}}))).unwrap(),
        sort: SortSpec::parse(Some("position")),
        page: Page::default(),
    };
    let rows = backend.list(&table, &query).await.unwrap();
    // Ties on position are broken by id
    assert_eq!(ids(&rows), vec![json!("a"), json!("b"), json!("c")]);

    let query = ListQuery {
        filter: Filter::default(),
        sort: SortSpec::parse(Some("-position")),
        page: Page::from_json(Some(&json!(2)), Some(&json!(1))),
    };
    let rows = backend.list(&table, &query).await.unwrap();
    assert_eq!(ids(&rows), vec![json!("c"), json!("a")]);

    // Unknown sort column falls back to id; unknown filter column matches nothing
    let query = ListQuery {
        filter: Filter::default(),
        sort: SortSpec::parse(Some("nickname")),
        page: Page::default(),
    };
    let rows = backend.list(&table, &query).await.unwrap();
    assert_eq!(ids(&rows), vec![json!("a"), json!("b"), json!("c"), json!("d")]);

    let query = ListQuery::filtered(Filter::default().eq("nickname", json!("x")));
    assert!(backend.list(&table, &query).await.unwrap().is_empty());

    drop_table(&pool, &table).await;
}

#[tokio::test]
async fn test_bulk_create_uses_field_union() {
    let Some((backend, pool)) = connect().await else {
        return;
    };
    let table = table_name("bulk");
    create_table(&pool, &table).await;

    let created = backend
        .bulk_create(
            &table,
            vec![
                record(json!({"name": "A"})),
                record(json!({"position": 4, "extra": true})),
            ],
            "it@example.org",
        )
        .await
        .unwrap();
    assert_eq!(created.len(), 2);
    assert_eq!(created[0]["name"], json!("A"));
    assert_eq!(created[0]["position"], Value::Null);
    assert_eq!(created[1]["name"], Value::Null);
    assert_eq!(created[1]["position"], json!(4));
    assert_ne!(created[0]["id"], created[1]["id"]);

    drop_table(&pool, &table).await;
}

#[tokio::test]
async fn test_read_side_coercion() {
    let Some((backend, pool)) = connect().await else {
        return;
    };
    let table = table_name("coerce");
    create_table(&pool, &table).await;

    let created = backend
        .create(
            &table,
            record(json!({
                "is_active": "yes",
                "settings": {"shifts": [1, 2]},
                "payload": {"nested": {"ok": true}},
                "hours": 8
            })),
            "it@example.org",
        )
        .await
        .unwrap();
    assert_eq!(created["is_active"], json!(true));
    assert_eq!(created["settings"], json!({"shifts": [1, 2]}));
    assert_eq!(created["payload"], json!({"nested": {"ok": true}}));
    assert_eq!(created["hours"], json!(8));

    drop_table(&pool, &table).await;
}

#[tokio::test]
async fn test_list_survives_added_column() {
    let Some((backend, pool)) = connect().await else {
        return;
    };
    let table = table_name("drift");
    create_table(&pool, &table).await;
    backend
        .create(&table, record(json!({"id": "a", "name": "A"})), "it@example.org")
        .await
        .unwrap();

    let before = backend.list(&table, &ListQuery::default()).await.unwrap();
    assert_eq!(before.len(), 1);
    assert!(before[0].get("extra").is_none());

    {
        let client = pool.get().await.unwrap();
        client
            .batch_execute(&format!(r#"ALTER TABLE "{}" ADD COLUMN extra text"#, table))
            .await
            .unwrap();
    }

    let after = backend.list(&table, &ListQuery::default()).await.unwrap();
    assert_eq!(ids(&after), vec![json!("a")]);
    assert_eq!(after[0]["extra"], Value::Null);
    assert!(backend.get(&table, "a").await.unwrap().is_some());

    drop_table(&pool, &table).await;
}

#[tokio::test]
async fn test_guarded_update_with_text_timestamps() {
    let Some((backend, pool)) = connect().await else {
        return;
    };
    let table = table_name("textts");
    {
        let client = pool.get().await.unwrap();
        client
            .batch_execute(&format!(
                r#"CREATE TABLE "{}" (
                    id text PRIMARY KEY,
                    name text,
                    created_date text,
                    updated_date text,
                    created_by text
                )"#,
                table
            ))
            .await
            .unwrap();
    }

    let created = backend
        .create(&table, record(json!({"name": "A"})), "it@example.org")
        .await
        .unwrap();
    let id = created["id"].as_str().unwrap();
    let token = created["updated_date"].clone();
    // Text columns keep millisecond precision: "YYYY-MM-DD HH:MM:SS.fff"
    assert_eq!(token.as_str().map(str::len), Some(23));

    let first = backend
        .update_guarded(&table, id, record(json!({"name": "B"})), &token)
        .await
        .unwrap();
    let GuardedUpdate::Applied(applied) = first else {
        panic!("expected applied update, got {:?}", first);
    };
    assert_eq!(applied["name"], json!("B"));

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = backend
        .update_guarded(&table, id, record(json!({"name": "C"})), &applied["updated_date"])
        .await
        .unwrap();
    assert!(matches!(second, GuardedUpdate::Applied(_)));

    // The token from the first write is now stale
    let third = backend
        .update_guarded(&table, id, record(json!({"name": "D"})), &applied["updated_date"])
        .await
        .unwrap();
    let GuardedUpdate::Stale(current) = third else {
        panic!("expected stale token, got {:?}", third);
    };
    assert_eq!(current["name"], json!("C"));

    drop_table(&pool, &table).await;
}
