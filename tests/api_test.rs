//! Integration tests for the API

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::{json, Value};
use tower::ServiceExt;

use chartstore_backend::{
    api::AppState,
    auth::{PermitAllPolicy, PolicyApi},
    bus::{Bus, BULK_DEPLOY_TOPIC},
    db::Database,
    helm::{HelmClient, ReleaseApi},
    service::{BulkService, ChartRepoService, InstallService, MigrationService},
};

struct TestEnv {
    app: axum::Router,
    db: Database,
    _deploy_rx: flume::Receiver<String>,
}

async fn setup_app() -> TestEnv {
    let db = Database::new("sqlite::memory:").await.unwrap();
    db.run_migrations().await.unwrap();

    let bus = Bus::new();
    let deploy_rx = bus.subscribe(BULK_DEPLOY_TOPIC);
    let locks = chartstore_backend::db::AppLocks::new();
    let policy: Arc<dyn PolicyApi> = Arc::new(PermitAllPolicy);
    let release: Arc<dyn ReleaseApi> = Arc::new(HelmClient::new());

    let install = Arc::new(InstallService::new(
        db.clone(),
        bus.clone(),
        locks,
        policy.clone(),
        None,
        release.clone(),
        false,
        None,
    ));
    let bulk = Arc::new(BulkService::new(
        db.clone(),
        bus.clone(),
        policy,
        false,
        None,
    ));
    let migration = Arc::new(MigrationService::new(
        db.clone(),
        bus,
        None,
        release,
        None,
        false,
        None,
    ));
    let chart_repos = Arc::new(ChartRepoService::new(db.clone(), None));

    let state = AppState {
        install,
        bulk,
        migration,
        chart_repos,
    };
    TestEnv {
        app: chartstore_backend::create_router(state),
        db,
        _deploy_rx: deploy_rx,
    }
}

async fn seed_environment(db: &Database) -> (i64, i64) {
    let cluster = sqlx::query(
        "INSERT INTO cluster (cluster_name, server_url, error_in_connecting) VALUES ('c1', 'https://k8s.example.com', '')",
    )
    .execute(db.pool())
    .await
    .unwrap()
    .last_insert_rowid();
    let env = sqlx::query(
        "INSERT INTO environment (environment_name, cluster_id, namespace, is_default) VALUES ('dev', ?, 'apps', 1)",
    )
    .bind(cluster)
    .execute(db.pool())
    .await
    .unwrap()
    .last_insert_rowid();
    (cluster, env)
}

async fn seed_chart_version(db: &Database, active: bool) -> i64 {
    let repo = sqlx::query("INSERT INTO chart_repo (name, url, active) VALUES ('bitnami', 'https://charts.bitnami.com/bitnami', ?)")
        .bind(active as i64)
        .execute(db.pool())
        .await
        .unwrap()
        .last_insert_rowid();
    sqlx::query(
        "INSERT INTO app_store_application_version (app_store_name, version, chart_repo_id) VALUES ('nginx', '15.2.0', ?)",
    )
    .bind(repo)
    .execute(db.pool())
    .await
    .unwrap()
    .last_insert_rowid()
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn post(uri: &str, payload: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let env = setup_app().await;

    let response = env
        .app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
}

#[tokio::test]
async fn test_install_and_fetch_detail() {
    let env = setup_app().await;
    let (_cluster, env_id) = seed_environment(&env.db).await;
    let chart_id = seed_chart_version(&env.db, true).await;

    let payload = json!({
        "appName": "nginx",
        "teamId": 1,
        "environmentId": env_id,
        "chartVersionId": chart_id,
        "valuesYaml": "replicaCount: 2"
    });
    let response = env
        .app
        .clone()
        .oneshot(post("/app-store/installed-app", payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["code"], 200);
    assert_eq!(json["result"]["status"], "ENQUEUED");
    let installed_app_id = json["result"]["installedAppId"].as_i64().unwrap();

    // one deploy message was published
    let raw = env._deploy_rx.try_recv().unwrap();
    let msg: Value = serde_json::from_str(&raw).unwrap();
    assert!(msg["installedAppVersionId"].as_i64().unwrap() > 0);

    let response = env
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/app-store/installed-app/{installed_app_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["result"]["appName"], "nginx");
    assert_eq!(json["result"]["chartVersion"], "15.2.0");
    assert_eq!(json["result"]["valuesYaml"], "replicaCount: 2");

    // and it shows up in the list
    let response = env
        .app
        .oneshot(
            Request::builder()
                .uri("/app-store/installed-app?appName=nginx")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["result"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_duplicate_binding_is_conflict() {
    let env = setup_app().await;
    let (_cluster, env_id) = seed_environment(&env.db).await;
    let chart_id = seed_chart_version(&env.db, true).await;

    let payload = json!({
        "appName": "redis",
        "teamId": 1,
        "environmentId": env_id,
        "chartVersionId": chart_id
    });
    let response = env
        .app
        .clone()
        .oneshot(post("/app-store/installed-app", payload.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = env
        .app
        .oneshot(post("/app-store/installed-app", payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_bulk_duplicate_names_rejected() {
    let env = setup_app().await;
    let (_cluster, env_id) = seed_environment(&env.db).await;
    let chart_id = seed_chart_version(&env.db, true).await;

    let payload = json!({
        "projectId": 1,
        "charts": [
            {"appName": "redis", "environmentId": env_id, "chartVersionId": chart_id},
            {"appName": "redis", "environmentId": env_id, "chartVersionId": chart_id}
        ]
    });
    let response = env
        .app
        .oneshot(post("/app-store/group/install", payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM installed_app")
        .fetch_one(env.db.pool())
        .await
        .unwrap();
    assert_eq!(count.0, 0);
}

#[tokio::test]
async fn test_inactive_chart_repo_is_not_acceptable() {
    let env = setup_app().await;
    let (_cluster, env_id) = seed_environment(&env.db).await;
    let chart_id = seed_chart_version(&env.db, false).await;

    let payload = json!({
        "appName": "nginx",
        "teamId": 1,
        "environmentId": env_id,
        "chartVersionId": chart_id
    });
    let response = env
        .app
        .oneshot(post("/app-store/installed-app", payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
    let json = body_json(response).await;
    assert_eq!(json["code"], 406);

    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM installed_app")
        .fetch_one(env.db.pool())
        .await
        .unwrap();
    assert_eq!(count.0, 0);
}

#[tokio::test]
async fn test_migrate_unreachable_cluster_is_unprocessable() {
    let env = setup_app().await;
    let (cluster, env_id) = seed_environment(&env.db).await;
    sqlx::query("UPDATE cluster SET error_in_connecting = 'connection refused' WHERE id = ?")
        .bind(cluster)
        .execute(env.db.pool())
        .await
        .unwrap();

    let payload = json!({
        "envId": env_id,
        "desiredDeploymentMode": "gitops"
    });
    let response = env
        .app
        .oneshot(post("/app-store/installed-app/migrate", payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let json = body_json(response).await;
    assert_eq!(json["code"], 422);
}

#[tokio::test]
async fn test_exists_endpoint() {
    let env = setup_app().await;
    let (_cluster, env_id) = seed_environment(&env.db).await;
    let chart_id = seed_chart_version(&env.db, true).await;

    let payload = json!({
        "appName": "nginx",
        "teamId": 1,
        "environmentId": env_id,
        "chartVersionId": chart_id
    });
    env.app
        .clone()
        .oneshot(post("/app-store/installed-app", payload))
        .await
        .unwrap();

    let response = env
        .app
        .oneshot(post(
            "/app-store/application/exists",
            json!({ "names": ["nginx", "unknown"] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let entries = json["result"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["name"], "nginx");
    assert_eq!(entries[0]["exists"], true);
    assert_eq!(entries[1]["exists"], false);
}

#[tokio::test]
async fn test_detail_of_unknown_app_is_not_found() {
    let env = setup_app().await;
    let response = env
        .app
        .oneshot(
            Request::builder()
                .uri("/app-store/installed-app/999")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["code"], 404);
    assert!(json["errors"].is_array());
}

#[tokio::test]
async fn test_timeline_of_fresh_install_is_empty() {
    let env = setup_app().await;
    let (_cluster, env_id) = seed_environment(&env.db).await;
    let chart_id = seed_chart_version(&env.db, true).await;

    let payload = json!({
        "appName": "nginx",
        "teamId": 1,
        "environmentId": env_id,
        "chartVersionId": chart_id
    });
    let response = env
        .app
        .clone()
        .oneshot(post("/app-store/installed-app", payload))
        .await
        .unwrap();
    let json = body_json(response).await;
    let installed_app_id = json["result"]["installedAppId"].as_i64().unwrap();

    let response = env
        .app
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/app-store/deployment-status/timeline/{installed_app_id}/{env_id}"
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["result"].as_array().unwrap().len(), 0);
}
