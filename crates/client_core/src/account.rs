use std::sync::Arc;

use shared::{
    domain::UserProfile,
    protocol::{AccessTokenResponse, RegisterRequest},
};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    gateway::{GatewayError, RequestGateway, RequestSpec},
    session::Token,
};

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("email and password are required")]
    MissingCredentials,
    #[error("not signed in")]
    NotSignedIn,
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Credential exchange and profile retrieval on top of the gateway.
pub struct AccountService {
    gateway: Arc<RequestGateway>,
}

impl AccountService {
    pub fn new(gateway: Arc<RequestGateway>) -> Self {
        Self { gateway }
    }

    /// Exchanges email and password for a token, fetches the profile with
    /// it, and only then signs the session in.
    pub async fn login_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<UserProfile, AccountError> {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            return Err(AccountError::MissingCredentials);
        }

        let grant: AccessTokenResponse = self
            .gateway
            .send_json(
                RequestSpec::post("/login/access-token")
                    .with_form([("username", email), ("password", password)])
                    .anonymous(),
            )
            .await?;
        let token = Token::new(grant.access_token);

        let profile: UserProfile = self
            .gateway
            .send_json(RequestSpec::get("/users/me").with_bearer(token.clone()))
            .await?;

        self.gateway.session().login(token, profile.clone());
        info!(user_id = %profile.id, "signed in");
        Ok(profile)
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
        full_name: Option<String>,
    ) -> Result<UserProfile, AccountError> {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            return Err(AccountError::MissingCredentials);
        }

        let request = RegisterRequest {
            email: email.to_string(),
            password: password.to_string(),
            full_name,
        };
        let profile: UserProfile = self
            .gateway
            .send_json(RequestSpec::post("/users/").with_json(&request)?.anonymous())
            .await?;
        info!(user_id = %profile.id, "account registered");
        Ok(profile)
    }

    /// Re-reads the profile for the current credential.
    pub async fn refresh_profile(&self) -> Result<UserProfile, AccountError> {
        let session = self.gateway.session();
        let token = session
            .current_credential()
            .ok_or(AccountError::NotSignedIn)?;

        let profile: UserProfile = self
            .gateway
            .send_json(RequestSpec::get("/users/me").with_bearer(token.clone()))
            .await?;

        if !session.refresh_profile_if_current(&token, profile.clone()) {
            debug!("session changed while the profile was in flight; not storing it");
        }
        Ok(profile)
    }

    pub fn logout(&self) -> bool {
        self.gateway.session().logout()
    }
}

#[cfg(test)]
#[path = "tests/account_tests.rs"]
mod tests;
