use std::sync::{PoisonError, RwLock};

use tokio::sync::broadcast;
use tracing::info;

pub const LOGIN_PATH: &str = "/login";
const AUTH_SURFACES: [&str; 2] = ["/login", "/register"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedirectReason {
    SessionExpired,
}

impl RedirectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RedirectReason::SessionExpired => "session_expired",
        }
    }
}

/// Location of the login surface carrying `reason` as its `error` parameter.
pub fn login_target(reason: RedirectReason) -> String {
    format!("{LOGIN_PATH}?error={}", reason.as_str())
}

pub fn is_auth_surface(path: &str) -> bool {
    AUTH_SURFACES.iter().any(|surface| path.contains(surface))
}

/// Outbound navigation signal raised by forced session invalidation.
pub trait Navigator: Send + Sync {
    fn current_path(&self) -> String;
    fn redirect_to_login(&self, reason: RedirectReason);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationEvent {
    LoginRequired {
        reason: RedirectReason,
        target: String,
    },
}

/// In-process [`Navigator`] that remembers where the presentation layer is
/// and publishes redirects to subscribers.
pub struct RouteTracker {
    path: RwLock<String>,
    events: broadcast::Sender<NavigationEvent>,
}

impl RouteTracker {
    pub fn new(initial_path: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            path: RwLock::new(initial_path.into()),
            events,
        }
    }

    pub fn set_path(&self, path: impl Into<String>) {
        *self.path.write().unwrap_or_else(PoisonError::into_inner) = path.into();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NavigationEvent> {
        self.events.subscribe()
    }
}

impl Navigator for RouteTracker {
    fn current_path(&self) -> String {
        self.path
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn redirect_to_login(&self, reason: RedirectReason) {
        let target = login_target(reason);
        self.set_path(target.clone());
        info!(%target, "navigating to login");
        let _ = self
            .events
            .send(NavigationEvent::LoginRequired { reason, target });
    }
}

#[cfg(test)]
#[path = "tests/navigation_tests.rs"]
mod tests;
