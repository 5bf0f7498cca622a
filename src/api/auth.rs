use crate::models::{Identity, UserId};
use crate::session::{AuthError, IdentityProvider};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const IDENTITY_TOOLKIT_URL: &str = "https://identitytoolkit.googleapis.com/v1";
pub const SECURE_TOKEN_URL: &str = "https://securetoken.googleapis.com/v1";

/// Id tokens are renewed this long before they run out.
const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(30);
const RETRY_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(60 * 60);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PasswordRequest<'a> {
    email: &'a str,
    password: &'a str,
    return_secure_token: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    local_id: String,
    email: Option<String>,
    id_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<String>,
}

// Secure Token API reply, snake_case unlike Identity Toolkit
#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Refresh token plus the lifetime of the id token issued with it.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Grant {
    refresh_token: String,
    lifetime: Duration,
}

fn lifetime(expires_in: Option<&str>) -> Duration {
    expires_in
        .and_then(|secs| secs.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TOKEN_LIFETIME)
}

fn refresh_delay(lifetime: Duration) -> Duration {
    lifetime
        .saturating_sub(REFRESH_MARGIN)
        .max(MIN_REFRESH_DELAY)
}

enum RefreshFailure {
    /// The refresh token is no longer accepted.
    Rejected(AuthError),
    Transient(AuthError),
}

struct Shared {
    client: Client,
    api_key: String,
    base_url: String,
    token_url: String,
    current: watch::Sender<Option<Identity>>,
}

impl Shared {
    async fn exchange(&self, refresh_token: &str) -> Result<TokenResponse, RefreshFailure> {
        let url = format!("{}/token?key={}", self.token_url, self.api_key);
        let res = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|err| RefreshFailure::Transient(err.into()))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            let err = map_auth_error(&body);
            return Err(if status.is_client_error() {
                RefreshFailure::Rejected(err)
            } else {
                RefreshFailure::Transient(err)
            });
        }
        res.json::<TokenResponse>()
            .await
            .map_err(|err| RefreshFailure::Transient(err.into()))
    }

    /// Swaps in a new id token if `uid` is still the one signed in.
    fn apply(&self, uid: &UserId, id_token: &str) -> bool {
        self.current.send_if_modified(|current| match current {
            Some(identity) if &identity.uid == uid => {
                identity.id_token = Some(id_token.to_string());
                true
            }
            _ => false,
        })
    }

    fn expire(&self, uid: &UserId) {
        self.current.send_if_modified(|current| {
            if current.as_ref().is_some_and(|identity| &identity.uid == uid) {
                *current = None;
                true
            } else {
                false
            }
        });
    }
}

async fn keep_fresh(shared: Arc<Shared>, uid: UserId, mut grant: Grant) {
    let mut delay = refresh_delay(grant.lifetime);
    loop {
        tokio::time::sleep(delay).await;
        match shared.exchange(&grant.refresh_token).await {
            Ok(token) => {
                if !shared.apply(&uid, &token.id_token) {
                    break;
                }
                debug!(%uid, "id token refreshed");
                grant = Grant {
                    refresh_token: token.refresh_token,
                    lifetime: lifetime(token.expires_in.as_deref()),
                };
                delay = refresh_delay(grant.lifetime);
            }
            Err(RefreshFailure::Transient(err)) => {
                warn!(%uid, %err, "token refresh failed, retrying");
                delay = RETRY_DELAY;
            }
            Err(RefreshFailure::Rejected(err)) => {
                info!(%uid, %err, "refresh token rejected, signing out");
                shared.expire(&uid);
                break;
            }
        }
    }
}

/// Email/password accounts through the Identity Toolkit REST API. The id
/// token is renewed in the background for as long as the user stays signed in.
pub struct FirebaseAuth {
    shared: Arc<Shared>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl FirebaseAuth {
    pub fn new(client: Client, api_key: impl Into<String>) -> Self {
        FirebaseAuth::with_base_url(client, api_key, IDENTITY_TOOLKIT_URL)
    }

    pub fn with_base_url(
        client: Client,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let (current, _) = watch::channel(None);
        FirebaseAuth {
            shared: Arc::new(Shared {
                client,
                api_key: api_key.into(),
                base_url: base_url.into(),
                token_url: SECURE_TOKEN_URL.to_string(),
                current,
            }),
            refresher: Mutex::new(None),
        }
    }

    fn start_refresh(&self, uid: UserId, grant: Grant) {
        let task = tokio::spawn(keep_fresh(Arc::clone(&self.shared), uid, grant));
        if let Some(previous) = self.refresher.lock().replace(task) {
            previous.abort();
        }
    }

    fn stop_refresh(&self) {
        if let Some(task) = self.refresher.lock().take() {
            task.abort();
        }
    }

    async fn password_call(
        &self,
        endpoint: &str,
        email: &str,
        password: &str,
    ) -> Result<Identity, AuthError> {
        let shared = &self.shared;
        let url = format!("{}/accounts:{}?key={}", shared.base_url, endpoint, shared.api_key);
        let email = email.trim();

        let res = shared
            .client
            .post(&url)
            .json(&PasswordRequest {
                email,
                password,
                return_secure_token: true,
            })
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await?;
            warn!(endpoint, %status, "identity toolkit rejected request");
            return Err(map_auth_error(&body));
        }

        let body = res.json::<AuthResponse>().await?;
        let identity = Identity::new(
            UserId::new(body.local_id),
            body.email.unwrap_or_else(|| email.to_string()),
        )
        .with_token(body.id_token);
        debug!(uid = %identity.uid, "identity toolkit accepted credentials");

        self.stop_refresh();
        shared.current.send_replace(Some(identity.clone()));
        match body.refresh_token {
            Some(refresh_token) => self.start_refresh(
                identity.uid.clone(),
                Grant {
                    refresh_token,
                    lifetime: lifetime(body.expires_in.as_deref()),
                },
            ),
            None => warn!(uid = %identity.uid, "no refresh token issued"),
        }
        Ok(identity)
    }
}

impl Drop for FirebaseAuth {
    fn drop(&mut self) {
        self.stop_refresh();
    }
}

/// Maps an Identity Toolkit error body (`{"error":{"message":"CODE : detail"}}`)
/// to an [`AuthError`].
pub fn map_auth_error(body: &str) -> AuthError {
    let message = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => envelope.error.message,
        Err(_) => return AuthError::Provider(body.trim().to_string()),
    };
    let code = message.split(':').next().unwrap_or_default().trim();

    match code {
        "EMAIL_NOT_FOUND" | "INVALID_PASSWORD" | "INVALID_LOGIN_CREDENTIALS" => {
            AuthError::InvalidCredentials
        }
        "EMAIL_EXISTS" => AuthError::EmailInUse,
        "WEAK_PASSWORD" => AuthError::WeakPassword,
        "INVALID_EMAIL" | "MISSING_EMAIL" => AuthError::InvalidEmail,
        _ => AuthError::Provider(message),
    }
}

#[async_trait]
impl IdentityProvider for FirebaseAuth {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        self.password_call("signInWithPassword", email, password)
            .await
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        self.password_call("signUp", email, password).await
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.stop_refresh();
        self.shared.current.send_replace(None);
        Ok(())
    }

    fn identity_changes(&self) -> watch::Receiver<Option<Identity>> {
        self.shared.current.subscribe()
    }
}
