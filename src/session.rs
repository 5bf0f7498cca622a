//! Session provider: tracks who is signed in and runs the auth operations.

use crate::models::Identity;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Invalid email or password.")]
    InvalidCredentials,
    #[error("An account already exists for this email.")]
    EmailInUse,
    #[error("Password should be at least 6 characters.")]
    WeakPassword,
    #[error("The email address is badly formatted.")]
    InvalidEmail,
    #[error("Network error: {0}")]
    Network(String),
    #[error("{0}")]
    Provider(String),
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        AuthError::Network(err.to_string())
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, AuthError>;

    async fn sign_up(&self, email: &str, password: &str) -> Result<Identity, AuthError>;

    async fn sign_out(&self) -> Result<(), AuthError>;

    /// Current identity plus every later change. Dropping the receiver
    /// unsubscribes.
    fn identity_changes(&self) -> watch::Receiver<Option<Identity>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionState {
    pub current_user: Option<Identity>,
    pub is_loading: bool,
    pub last_error: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState {
            current_user: None,
            is_loading: true,
            last_error: None,
        }
    }
}

pub struct Session {
    provider: Arc<dyn IdentityProvider>,
    state: Arc<watch::Sender<SessionState>>,
    listener: JoinHandle<()>,
}

impl Session {
    /// Starts following the provider's identity changes. Must be called from
    /// inside a tokio runtime.
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        let state = Arc::new(state);
        let mut changes = provider.identity_changes();

        let listener = tokio::spawn({
            let state = Arc::clone(&state);
            async move {
                loop {
                    let identity = changes.borrow_and_update().clone();
                    debug!(signed_in = identity.is_some(), "identity changed");
                    state.send_modify(|s| {
                        s.current_user = identity;
                        s.is_loading = false;
                        s.last_error = None;
                    });
                    if changes.changed().await.is_err() {
                        break;
                    }
                }
            }
        });

        Session {
            provider,
            state,
            listener,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn current_user(&self) -> Option<Identity> {
        self.state.borrow().current_user.clone()
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        let _loading = self.begin();
        let result = self.provider.sign_in(email, password).await;
        if let Ok(identity) = &result {
            info!(email = %identity.email, "signed in");
            self.set_user(Some(identity.clone()));
        }
        self.record(&result);
        result
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        let _loading = self.begin();
        let result = self.provider.sign_up(email, password).await;
        if let Ok(identity) = &result {
            info!(email = %identity.email, "signed up");
            self.set_user(Some(identity.clone()));
        }
        self.record(&result);
        result
    }

    pub async fn sign_out(&self) -> Result<(), AuthError> {
        let _loading = self.begin();
        let result = self.provider.sign_out().await;
        if result.is_ok() {
            info!("signed out");
            self.set_user(None);
        }
        self.record(&result);
        result
    }

    fn begin(&self) -> LoadingGuard<'_> {
        self.state.send_modify(|s| s.is_loading = true);
        LoadingGuard(&self.state)
    }

    fn set_user(&self, identity: Option<Identity>) {
        self.state.send_modify(|s| s.current_user = identity);
    }

    fn record<T>(&self, result: &Result<T, AuthError>) {
        match result {
            Ok(_) => self.state.send_modify(|s| s.last_error = None),
            Err(err) => {
                warn!(%err, "auth operation failed");
                let message = err.to_string();
                self.state.send_modify(|s| s.last_error = Some(message));
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

// Clears the loading flag even if the auth future is dropped mid-flight.
struct LoadingGuard<'a>(&'a watch::Sender<SessionState>);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|s| s.is_loading = false);
    }
}
