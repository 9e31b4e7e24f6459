use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use shared::domain::UserProfile;
use storage::{load_session, save_session, KeyValueStore, MemoryKeyValueStore, PersistedSession};
use tokio::sync::watch;
use tracing::{info, warn};
use zeroize::Zeroize;

const TOKEN_PREVIEW_CHARS: usize = 8;

/// Opaque bearer credential. Never decoded or inspected locally.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    fn preview(&self) -> String {
        let prefix: String = self.0.chars().take(TOKEN_PREVIEW_CHARS).collect();
        format!("{prefix}…")
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Token").field(&self.preview()).finish()
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Authenticated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SignedIn {
    credential: Token,
    profile: UserProfile,
}

/// Authentication state of this client.
///
/// Credential and profile are stored together, so a session is either fully
/// signed in or fully anonymous.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    signed_in: Option<SignedIn>,
}

impl Session {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(credential: Token, profile: UserProfile) -> Self {
        Self {
            signed_in: Some(SignedIn {
                credential,
                profile,
            }),
        }
    }

    pub fn credential(&self) -> Option<&Token> {
        self.signed_in.as_ref().map(|s| &s.credential)
    }

    pub fn profile(&self) -> Option<&UserProfile> {
        self.signed_in.as_ref().map(|s| &s.profile)
    }

    pub fn is_authenticated(&self) -> bool {
        self.signed_in.is_some()
    }

    pub fn state(&self) -> SessionState {
        if self.is_authenticated() {
            SessionState::Authenticated
        } else {
            SessionState::Anonymous
        }
    }

    fn to_persisted(&self) -> PersistedSession {
        match &self.signed_in {
            Some(signed_in) => PersistedSession::authenticated(
                signed_in.credential.expose(),
                signed_in.profile.clone(),
            ),
            None => PersistedSession::anonymous(),
        }
    }
}

/// Owner of the process-wide [`Session`].
///
/// Mutations replace the whole session, persist it, and notify subscribers
/// before returning. Reads never wait on persistence.
pub struct SessionStore {
    current: watch::Sender<Session>,
    storage: Arc<dyn KeyValueStore>,
    writer: Mutex<()>,
    generation: AtomicU64,
}

impl SessionStore {
    /// Opens the store, rehydrating any session persisted by a previous run.
    pub fn open(storage: Arc<dyn KeyValueStore>) -> Self {
        let session = match load_session(storage.as_ref()) {
            Ok(Some(persisted)) => match persisted.into_parts() {
                Some((credential, profile)) => {
                    info!(user_id = %profile.id, "restored persisted session");
                    Session::authenticated(Token::new(credential), profile)
                }
                None => Session::anonymous(),
            },
            Ok(None) => Session::anonymous(),
            Err(error) => {
                warn!(%error, "ignoring unreadable persisted session");
                Session::anonymous()
            }
        };

        let generation = u64::from(session.is_authenticated());
        let (current, _) = watch::channel(session);
        Self {
            current,
            storage,
            writer: Mutex::new(()),
            generation: AtomicU64::new(generation),
        }
    }

    pub fn in_memory() -> Self {
        Self::open(Arc::new(MemoryKeyValueStore::new()))
    }

    /// Replaces the session with a signed-in one. Re-login is allowed.
    pub fn login(&self, credential: Token, profile: UserProfile) {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let user_id = profile.id;
        let session = Session::authenticated(credential, profile);
        let persisted = session.to_persisted();

        self.generation.fetch_add(1, Ordering::SeqCst);
        self.current.send_replace(session);
        self.persist(&persisted);
        info!(%user_id, "session established");
    }

    /// Clears the session. Returns `false` when it was already anonymous.
    pub fn logout(&self) -> bool {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.clear()
    }

    /// Clears the session only while `expected` is still its credential
    /// (`None` matching an anonymous session).
    ///
    /// Returns the generation that was current at the time of the check, or
    /// `None` when the credential had already changed and nothing was done.
    pub fn logout_if_current(&self, expected: Option<&Token>) -> Option<u64> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.current.borrow().credential() != expected {
            return None;
        }
        let generation = self.generation();
        self.clear();
        Some(generation)
    }

    /// Swaps in a fresh profile while `credential` is still the session's.
    /// The generation is unchanged.
    pub fn refresh_profile_if_current(&self, credential: &Token, profile: UserProfile) -> bool {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.current.borrow().credential() != Some(credential) {
            return false;
        }
        let session = Session::authenticated(credential.clone(), profile);
        let persisted = session.to_persisted();
        self.current.send_replace(session);
        self.persist(&persisted);
        true
    }

    /// Caller holds `writer`.
    fn clear(&self) -> bool {
        if !self.current.borrow().is_authenticated() {
            return false;
        }
        self.current.send_replace(Session::anonymous());
        self.persist(&PersistedSession::anonymous());
        info!("session cleared");
        true
    }

    pub fn current_credential(&self) -> Option<Token> {
        self.current.borrow().credential().cloned()
    }

    pub fn current_profile(&self) -> Option<UserProfile> {
        self.current.borrow().profile().cloned()
    }

    pub fn is_authenticated(&self) -> bool {
        self.current.borrow().is_authenticated()
    }

    pub fn snapshot(&self) -> Session {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.current.subscribe()
    }

    /// Number of logins this store has seen, counting a rehydrated session.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn persist(&self, persisted: &PersistedSession) {
        if let Err(error) = save_session(self.storage.as_ref(), persisted) {
            warn!(%error, "failed to persist session; keeping in-memory state");
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
