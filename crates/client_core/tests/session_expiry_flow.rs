use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, post, put},
    Form, Json, Router,
};
use client_core::{
    ClientSettings, ErrorKind, NavigationEvent, Navigator, PipelineError, RedirectReason,
    RouteTracker, TrackerClient, TransitionOutcome,
};
use serde_json::{json, Value};
use shared::domain::{JobId, Stage};
use tokio::{net::TcpListener, sync::broadcast::error::TryRecvError};

const TOKEN: &str = "tok-e2e";

#[derive(Clone, Default)]
struct Backend {
    revoked: Arc<AtomicBool>,
}

impl Backend {
    fn authorised(&self, headers: &HeaderMap) -> bool {
        let expected = format!("Bearer {TOKEN}");
        !self.revoked.load(Ordering::SeqCst)
            && headers
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                == Some(expected.as_str())
    }
}

fn rejected() -> (StatusCode, Json<Value>) {
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "detail": "Could not validate credentials" })),
    )
}

async fn access_token(Form(_fields): Form<HashMap<String, String>>) -> Json<Value> {
    Json(json!({ "access_token": TOKEN, "token_type": "bearer" }))
}

async fn users_me(State(backend): State<Backend>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    if !backend.authorised(&headers) {
        return rejected();
    }
    (
        StatusCode::OK,
        Json(json!({ "id": 1, "email": "ada@example.com", "full_name": "Ada", "is_active": true })),
    )
}

async fn list_jobs(State(backend): State<Backend>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    if !backend.authorised(&headers) {
        return rejected();
    }
    (
        StatusCode::OK,
        Json(json!([
            { "id": 1, "title": "Backend engineer", "company": "Acme", "status": "APPLIED" },
            { "id": 2, "title": "Platform engineer", "company": "Globex", "status": "SAVED" },
        ])),
    )
}

async fn update_job(
    State(backend): State<Backend>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(patch): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if !backend.authorised(&headers) {
        return rejected();
    }
    (
        StatusCode::OK,
        Json(json!({ "id": id, "title": "Backend engineer", "status": patch["status"] })),
    )
}

async fn spawn_backend(backend: Backend) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let app = Router::new()
        .route("/api/v1/login/access-token", post(access_token))
        .route("/api/v1/users/me", get(users_me))
        .route("/api/v1/jobs/", get(list_jobs))
        .route("/api/v1/jobs/:id", put(update_job))
        .with_state(backend);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}/api/v1/")
}

fn settings(api_base_url: String, data_dir: &std::path::Path) -> ClientSettings {
    ClientSettings {
        api_base_url,
        request_timeout: Duration::from_secs(5),
        data_dir: data_dir.to_path_buf(),
        ..ClientSettings::default()
    }
}

#[tokio::test]
async fn revoked_session_ends_with_one_login_redirect() {
    let backend = Backend::default();
    let server_url = spawn_backend(backend.clone()).await;
    let data_dir = tempfile::tempdir().expect("tempdir");
    let routes = Arc::new(RouteTracker::new("/login"));
    let mut navigation = routes.subscribe();

    let client =
        TrackerClient::open(&settings(server_url.clone(), data_dir.path()), routes.clone())
            .expect("client");
    assert!(!client.session().is_authenticated());

    client
        .accounts()
        .login_with_password("ada@example.com", "pw")
        .await
        .expect("login");
    routes.set_path("/dashboard/applications");

    let pipeline = client.pipeline();
    assert_eq!(pipeline.load_all().await.expect("load"), 2);

    let ticket = pipeline
        .transition(JobId(1), Stage::Interviewing)
        .expect("transition")
        .expect("ticket");
    assert!(matches!(
        ticket.wait().await.expect("join"),
        TransitionOutcome::Confirmed
    ));

    backend.revoked.store(true, Ordering::SeqCst);
    let ticket = pipeline
        .transition(JobId(1), Stage::Offer)
        .expect("transition")
        .expect("ticket");
    match ticket.wait().await.expect("join") {
        TransitionOutcome::RolledBack { restored, error } => {
            assert_eq!(restored, Stage::Interviewing);
            assert_eq!(error.kind(), ErrorKind::AuthRejected);
        }
        other => panic!("expected rollback, got {other:?}"),
    }

    assert!(!client.session().is_authenticated());
    assert_eq!(client.session().current_credential(), None);
    assert_eq!(routes.current_path(), "/login?error=session_expired");

    // Follow-up failures must not navigate again.
    match pipeline.load_all().await {
        Err(PipelineError::Gateway(error)) => assert_eq!(error.kind(), ErrorKind::AuthRejected),
        other => panic!("expected auth rejection, got {other:?}"),
    }

    assert_eq!(
        navigation.try_recv().expect("redirect"),
        NavigationEvent::LoginRequired {
            reason: RedirectReason::SessionExpired,
            target: "/login?error=session_expired".into(),
        }
    );
    assert!(matches!(navigation.try_recv(), Err(TryRecvError::Empty)));

    let reopened = TrackerClient::open(
        &settings(server_url, data_dir.path()),
        Arc::new(RouteTracker::new("/")),
    )
    .expect("reopen");
    assert!(!reopened.session().is_authenticated());
}

#[tokio::test]
async fn signed_in_session_survives_a_restart() {
    let server_url = spawn_backend(Backend::default()).await;
    let data_dir = tempfile::tempdir().expect("tempdir");

    {
        let client = TrackerClient::open(
            &settings(server_url.clone(), data_dir.path()),
            Arc::new(RouteTracker::new("/login")),
        )
        .expect("client");
        client
            .accounts()
            .login_with_password("ada@example.com", "pw")
            .await
            .expect("login");
    }

    let client = TrackerClient::open(
        &settings(server_url, data_dir.path()),
        Arc::new(RouteTracker::new("/dashboard")),
    )
    .expect("reopen");
    assert!(client.session().is_authenticated());
    assert_eq!(
        client.session().current_profile().map(|p| p.email),
        Some("ada@example.com".to_string())
    );
    assert_eq!(client.pipeline().load_all().await.expect("load"), 2);
}
