//! Backend mode resolution and routing

use crate::common::{TestHarness, record, user};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use entityproxy::commands::EntityRequest;
use entityproxy::config::Settings;
use entityproxy::dispatch::BackendMode;
use serde_json::{Value, json};

fn request(body: Value) -> EntityRequest {
    serde_json::from_value(body).unwrap()
}

#[tokio::test]
async fn test_relational_mode_routes_to_relational_store() {
    let harness = TestHarness::new(Some("postgres"));
    harness
        .relational
        .seed("Doctor", vec![json!({"id": "r1", "name": "Relational"})]);
    harness
        .managed
        .seed("Doctor", vec![json!({"id": "m1", "name": "Managed"})]);

    let body = harness
        .service
        .handle_action(&user(), None, request(json!({"action": "list", "entity": "Doctor"})))
        .await
        .unwrap();
    assert_eq!(body[0]["id"], json!("r1"));
    assert_eq!(
        harness.service.dispatcher().resolver().cached(),
        Some(BackendMode::Relational)
    );
}

#[tokio::test]
async fn test_mode_is_read_once_and_cached() {
    let harness = TestHarness::new(Some("postgres"));
    let list = || request(json!({"action": "list", "entity": "Doctor"}));

    for _ in 0..3 {
        harness
            .service
            .handle_action(&user(), None, list())
            .await
            .unwrap();
    }
    // One settings read; the relational store served the entity lists
    assert_eq!(harness.managed.list_calls(), 1);
    assert_eq!(harness.relational.list_calls(), 3);

    // Changing the stored setting has no effect on a running process
    harness.managed.seed(
        "AppSetting",
        vec![json!({"id": "s2", "key": "db_mode", "value": "managed"})],
    );
    harness
        .service
        .handle_action(&user(), None, list())
        .await
        .unwrap();
    assert_eq!(harness.relational.list_calls(), 4);
}

#[tokio::test]
async fn test_missing_setting_resolves_to_managed() {
    let harness = TestHarness::new(None);
    harness
        .managed
        .seed("Doctor", vec![json!({"id": "m1"})]);

    let body = harness
        .service
        .handle_action(&user(), None, request(json!({"action": "list", "entity": "Doctor"})))
        .await
        .unwrap();
    assert_eq!(body[0]["id"], json!("m1"));
    assert_eq!(
        harness.service.dispatcher().resolver().cached(),
        Some(BackendMode::Managed)
    );
    assert!(harness.source.seen().is_empty());
}

#[tokio::test]
async fn test_failed_setting_read_defaults_to_managed_and_retries() {
    let harness = TestHarness::new(Some("postgres"));
    harness
        .managed
        .seed("Doctor", vec![json!({"id": "m1"})]);
    let get = || request(json!({"action": "get", "entity": "Doctor", "id": "m1"}));

    harness.managed.set_fail_reads(true);
    let resolver = harness.service.dispatcher().resolver();
    let backend = harness
        .service
        .dispatcher()
        .backend_for("Doctor", None)
        .await
        .unwrap();
    assert_eq!(backend.name(), "memory");
    assert_eq!(resolver.cached(), None);
    assert!(harness.source.seen().is_empty());

    // The managed store recovers: the next request re-reads the setting
    harness.managed.set_fail_reads(false);
    let body = harness
        .service
        .handle_action(&user(), None, get())
        .await
        .unwrap();
    assert_eq!(body, Value::Null);
    assert_eq!(resolver.cached(), Some(BackendMode::Relational));
    assert_eq!(harness.managed.list_calls(), 2);
}

#[tokio::test]
async fn test_always_managed_entities_bypass_relational_mode() {
    let harness = TestHarness::new(Some("postgres"));

    let body = harness
        .service
        .handle_action(
            &user(),
            None,
            request(json!({"action": "list", "entity": "AppSetting"})),
        )
        .await
        .unwrap();
    assert_eq!(body[0]["key"], json!("db_mode"));
    assert_eq!(harness.relational.list_calls(), 0);
    assert!(harness.source.seen().is_empty());
}

#[tokio::test]
async fn test_configured_always_managed_list() {
    let mut settings = Settings::default();
    settings.dispatch.always_managed.push("AuditLog".to_string());
    let harness = TestHarness::with_settings(Some("postgres"), settings);

    harness
        .service
        .handle_action(
            &user(),
            None,
            request(json!({"action": "create", "entity": "AuditLog", "data": {"event": "login"}})),
        )
        .await
        .unwrap();
    assert_eq!(harness.managed.rows("AuditLog").len(), 1);
    assert!(harness.relational.rows("AuditLog").is_empty());
}

#[tokio::test]
async fn test_credential_token_selects_tenant() {
    let harness = TestHarness::new(Some("postgres"));
    let token = STANDARD.encode(
        json!({
            "host": " tenant-db.internal ",
            "port": "6432",
            "user": "tenant",
            "password": "pw",
            "database": "tenant_roster"
        })
        .to_string(),
    );

    harness
        .service
        .handle_action(
            &user(),
            Some(&token),
            request(json!({"action": "list", "entity": "Doctor"})),
        )
        .await
        .unwrap();
    let seen = harness.source.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].host, "tenant-db.internal");
    assert_eq!(seen[0].port, 6432);
    assert_eq!(seen[0].database, "tenant_roster");
    assert_eq!(seen[0].username, "tenant");
}

#[tokio::test]
async fn test_bad_credential_token_falls_back_to_default_tenant() {
    let harness = TestHarness::new(Some("postgres"));

    harness
        .service
        .handle_action(
            &user(),
            Some("%%% not base64 %%%"),
            request(json!({"action": "list", "entity": "Doctor"})),
        )
        .await
        .unwrap();
    harness
        .service
        .handle_action(&user(), None, request(json!({"action": "list", "entity": "Doctor"})))
        .await
        .unwrap();
    let seen = harness.source.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], crate::common::test_connection_config());
    assert_eq!(seen[1], crate::common::test_connection_config());
}

#[tokio::test]
async fn test_created_by_comes_from_identity() {
    let harness = TestHarness::new(Some("postgres"));
    let created = harness
        .service
        .handle_action(
            &user(),
            None,
            request(json!({"action": "create", "entity": "Doctor", "data": {"name": "A"}})),
        )
        .await
        .unwrap();
    assert_eq!(created["created_by"], json!("planner@example.org"));
    assert_eq!(
        harness.relational.rows("Doctor")[0],
        record(created)
    );
}
