//! Managed backend client against a local stand-in API

use crate::common::record;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use entityproxy::config::settings::ManagedSettings;
use entityproxy::db::query::{Filter, ListQuery, Page, SortSpec};
use entityproxy::db::{EntityBackend, ManagedBackend};
use entityproxy::error::DbError;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// What the stand-in API saw
#[derive(Default)]
struct Seen {
    queries: Vec<HashMap<String, String>>,
    bodies: Vec<Value>,
    api_keys: Vec<Option<String>>,
}

type Shared = Arc<Mutex<Seen>>;

fn remember_key(seen: &Shared, headers: &HeaderMap) {
    let key = headers
        .get("api_key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    seen.lock().unwrap().api_keys.push(key);
}

async fn list(
    State(seen): State<Shared>,
    Path((_app, entity)): Path<(String, String)>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    remember_key(&seen, &headers);
    seen.lock().unwrap().queries.push(params);
    if entity == "Broken" {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"message": "maintenance window"})),
        );
    }
    (StatusCode::OK, Json(json!([{"id": "m1", "entity": entity}])))
}

async fn create(
    State(seen): State<Shared>,
    Path((_app, _entity)): Path<(String, String)>,
    Json(mut body): Json<Value>,
) -> Json<Value> {
    seen.lock().unwrap().bodies.push(body.clone());
    body["id"] = json!("m-new");
    Json(body)
}

async fn bulk(
    State(seen): State<Shared>,
    Path((_app, _entity)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Json<Value> {
    seen.lock().unwrap().bodies.push(body.clone());
    Json(body)
}

async fn get_one(Path((_app, _entity, id)): Path<(String, String, String)>) -> (StatusCode, Json<Value>) {
    if id == "ghost" {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "not found"})));
    }
    (StatusCode::OK, Json(json!({"id": id})))
}

async fn update_one(
    State(seen): State<Shared>,
    Path((_app, _entity, id)): Path<(String, String, String)>,
    Json(mut body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    seen.lock().unwrap().bodies.push(body.clone());
    if id == "ghost" {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "not found"})));
    }
    body["id"] = json!(id);
    (StatusCode::OK, Json(body))
}

async fn delete_one(Path((_app, _entity, id)): Path<(String, String, String)>) -> StatusCode {
    if id == "ghost" {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::NO_CONTENT
    }
}

/// Serve the stand-in API on an ephemeral port
async fn spawn_managed_api() -> (ManagedBackend, Shared) {
    let seen = Shared::default();
    let app = Router::new()
        .route("/apps/{app}/entities/{entity}", get(list).post(create))
        .route("/apps/{app}/entities/{entity}/bulk", post(bulk))
        .route(
            "/apps/{app}/entities/{entity}/{id}",
            get(get_one).put(update_one).delete(delete_one),
        )
        .with_state(seen.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let settings = ManagedSettings {
        base_url: format!("http://{}/", addr),
        app_id: "roster-app".to_string(),
        api_key: Some("k-123".to_string()),
        ..ManagedSettings::default()
    };
    (ManagedBackend::new(&settings).unwrap(), seen)
}

#[tokio::test]
async fn test_list_sends_query_parameters() {
    let (backend, seen) = spawn_managed_api().await;
    let query = ListQuery {
        filter: Filter::from_json(Some(&json!({"doctor_id": "d1"}))).unwrap(),
        sort: SortSpec::parse(Some("-date")),
        page: Page::from_json(Some(&json!(20)), Some(&json!(40))),
    };

    let rows = backend.list("ShiftEntry", &query).await.unwrap();
    assert_eq!(rows[0]["entity"], json!("ShiftEntry"));

    let seen = seen.lock().unwrap();
    let params = &seen.queries[0];
    let q: Value = serde_json::from_str(&params["q"]).unwrap();
    assert_eq!(q, json!({"doctor_id": "d1"}));
    assert_eq!(params["sort"], "-date");
    assert_eq!(params["limit"], "20");
    assert_eq!(params["skip"], "40");
    assert_eq!(seen.api_keys[0].as_deref(), Some("k-123"));
}

#[tokio::test]
async fn test_list_without_filter_omits_q() {
    let (backend, seen) = spawn_managed_api().await;
    backend.list("Doctor", &ListQuery::default()).await.unwrap();

    let seen = seen.lock().unwrap();
    assert!(!seen.queries[0].contains_key("q"));
    assert!(!seen.queries[0].contains_key("limit"));
    assert_eq!(seen.queries[0]["sort"], "id");
}

#[tokio::test]
async fn test_missing_records() {
    let (backend, _) = spawn_managed_api().await;
    assert_eq!(backend.get("Doctor", "ghost").await.unwrap(), None);
    assert_eq!(
        backend.get("Doctor", "d1").await.unwrap(),
        Some(record(json!({"id": "d1"})))
    );
    assert_eq!(
        backend
            .update("Doctor", "ghost", record(json!({"name": "x"})))
            .await
            .unwrap(),
        None
    );
    backend.delete("Doctor", "ghost").await.unwrap();
    backend.delete("Doctor", "d1").await.unwrap();
}

#[tokio::test]
async fn test_create_adds_created_by_when_absent() {
    let (backend, seen) = spawn_managed_api().await;
    let created = backend
        .create("Doctor", record(json!({"name": "Ada"})), "planner@example.org")
        .await
        .unwrap();
    assert_eq!(created["id"], json!("m-new"));
    backend
        .create(
            "Doctor",
            record(json!({"name": "Bob", "created_by": "import@example.org"})),
            "planner@example.org",
        )
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.bodies[0]["created_by"], json!("planner@example.org"));
    assert_eq!(seen.bodies[1]["created_by"], json!("import@example.org"));
}

#[tokio::test]
async fn test_update_strips_system_fields() {
    let (backend, seen) = spawn_managed_api().await;
    let updated = backend
        .update(
            "Doctor",
            "d1",
            record(json!({
                "id": "other",
                "name": "Ada",
                "created_date": "2020-01-01",
                "updated_date": "2020-01-01",
                "created_by": "someone"
            })),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated["id"], json!("d1"));
    assert_eq!(seen.lock().unwrap().bodies[0], json!({"name": "Ada"}));
}

#[tokio::test]
async fn test_bulk_create_posts_all_records() {
    let (backend, seen) = spawn_managed_api().await;
    let created = backend
        .bulk_create(
            "Doctor",
            vec![record(json!({"name": "A"})), record(json!({"name": "B"}))],
            "admin@example.org",
        )
        .await
        .unwrap();
    assert_eq!(created.len(), 2);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.bodies[0][1]["created_by"], json!("admin@example.org"));
}

#[tokio::test]
async fn test_error_status_becomes_upstream_error() {
    let (backend, _) = spawn_managed_api().await;
    let err = backend
        .list("Broken", &ListQuery::default())
        .await
        .unwrap_err();
    match err {
        DbError::Upstream { status, message } => {
            assert_eq!(status, 503);
            assert_eq!(message, "maintenance window");
        }
        other => panic!("expected upstream error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_api() {
    let settings = ManagedSettings {
        base_url: "http://127.0.0.1:1".to_string(),
        timeout_secs: 2,
        ..ManagedSettings::default()
    };
    let backend = ManagedBackend::new(&settings).unwrap();
    let err = backend.get("Doctor", "d1").await.unwrap_err();
    assert!(matches!(err, DbError::UpstreamUnavailable(_)));
}
