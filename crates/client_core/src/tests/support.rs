use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use serde_json::Value;
use shared::domain::{UserId, UserProfile};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
};

use crate::{
    navigation::{Navigator, RedirectReason},
    transport::{OutboundRequest, RawResponse, Transport, TransportFailure},
};

pub fn profile(id: i64) -> UserProfile {
    UserProfile {
        id: UserId(id),
        email: format!("user{id}@example.com"),
        full_name: Some(format!("User {id}")),
        is_active: true,
    }
}

pub struct RecordingNavigator {
    path: Mutex<String>,
    redirects: Mutex<Vec<RedirectReason>>,
}

impl RecordingNavigator {
    pub fn at(path: &str) -> Arc<Self> {
        Arc::new(Self {
            path: Mutex::new(path.to_string()),
            redirects: Mutex::new(Vec::new()),
        })
    }

    pub fn redirects(&self) -> Vec<RedirectReason> {
        self.redirects.lock().expect("redirects").clone()
    }
}

impl Navigator for RecordingNavigator {
    fn current_path(&self) -> String {
        self.path.lock().expect("path").clone()
    }

    fn redirect_to_login(&self, reason: RedirectReason) {
        self.redirects.lock().expect("redirects").push(reason);
    }
}

/// One request waiting for the test to answer it.
pub struct Exchange {
    pub request: OutboundRequest,
    reply: oneshot::Sender<Result<RawResponse, TransportFailure>>,
}

impl Exchange {
    pub fn respond(self, status: u16, body: Value) {
        let _ = self.reply.send(Ok(RawResponse {
            status,
            body: serde_json::to_vec(&body).expect("encode body"),
        }));
    }

    pub fn fail(self) {
        let _ = self
            .reply
            .send(Err(TransportFailure::Unreachable("connection refused".into())));
    }
}

/// Transport that hands every request to the test, which answers in any
/// order it likes.
pub struct ChannelTransport {
    requests: mpsc::UnboundedSender<Exchange>,
}

impl ChannelTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Exchange>) {
        let (requests, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { requests }), rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn execute(&self, request: OutboundRequest) -> Result<RawResponse, TransportFailure> {
        let (reply, answer) = oneshot::channel();
        self.requests
            .send(Exchange { request, reply })
            .map_err(|_| TransportFailure::Unreachable("test harness gone".into()))?;
        answer
            .await
            .unwrap_or_else(|_| Err(TransportFailure::Unreachable("request dropped".into())))
    }
}

pub async fn spawn_server(app: Router) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}
