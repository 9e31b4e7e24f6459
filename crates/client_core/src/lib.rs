use std::sync::Arc;

use anyhow::{Context, Result};
use storage::{FileKeyValueStore, KeyValueStore};

pub mod account;
pub mod config;
pub mod gateway;
pub mod navigation;
pub mod pipeline;
pub mod session;
pub mod transport;

pub use account::{AccountError, AccountService};
pub use config::{load_settings, ClientSettings};
pub use gateway::{Authorization, ErrorKind, GatewayError, RequestGateway, RequestSpec};
pub use navigation::{NavigationEvent, Navigator, RedirectReason, RouteTracker};
pub use pipeline::{
    PipelineController, PipelineEntity, PipelineError, PipelineEvent, TransitionOutcome,
    TransitionTicket,
};
pub use session::{Session, SessionState, SessionStore, Token};
pub use transport::{ReqwestTransport, Transport};

/// Session store, gateway, pipeline and account service wired together.
pub struct TrackerClient {
    session: Arc<SessionStore>,
    gateway: Arc<RequestGateway>,
    pipeline: Arc<PipelineController>,
    accounts: AccountService,
}

impl TrackerClient {
    /// Builds a client that talks HTTP to the configured backend and keeps
    /// its session under `settings.data_dir`.
    pub fn open(settings: &ClientSettings, navigator: Arc<dyn Navigator>) -> Result<Self> {
        let base_url = settings.validated_base_url()?;
        let transport = ReqwestTransport::new(base_url, settings.request_timeout)
            .context("failed to build HTTP client")?;
        let storage = FileKeyValueStore::new(&settings.data_dir);
        Ok(Self::with_parts(
            Arc::new(transport),
            Arc::new(storage),
            navigator,
        ))
    }

    pub fn with_parts(
        transport: Arc<dyn Transport>,
        storage: Arc<dyn KeyValueStore>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        let session = Arc::new(SessionStore::open(storage));
        let gateway = Arc::new(RequestGateway::new(
            transport,
            Arc::clone(&session),
            navigator,
        ));
        let pipeline = PipelineController::new(Arc::clone(&gateway));
        let accounts = AccountService::new(Arc::clone(&gateway));
        Self {
            session,
            gateway,
            pipeline,
            accounts,
        }
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub fn gateway(&self) -> &Arc<RequestGateway> {
        &self.gateway
    }

    pub fn pipeline(&self) -> &Arc<PipelineController> {
        &self.pipeline
    }

    pub fn accounts(&self) -> &AccountService {
        &self.accounts
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
