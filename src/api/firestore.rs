use super::fields::{
    decode_profile, decode_task, encode_new_task, encode_patch, encode_profile, Document,
    ListResponse,
};
use crate::models::{Identity, NewTask, Profile, Task, TaskId, TaskPatch, UserId};
use crate::store::{DocumentStore, Snapshot, StoreError, Subscription};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

pub const FIRESTORE_URL: &str = "https://firestore.googleapis.com/v1";

const PAGE_SIZE: &str = "300";

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(default)]
    status: String,
}

/// Task collections in Cloud Firestore over REST. Requests carry the id token
/// of whoever is signed in, read from the identity provider's feed.
#[derive(Clone)]
pub struct FirestoreStore {
    client: Client,
    documents_url: String,
    identities: watch::Receiver<Option<Identity>>,
    poll_interval: Duration,
}

impl FirestoreStore {
    pub fn new(
        client: Client,
        project_id: &str,
        identities: watch::Receiver<Option<Identity>>,
        poll_interval: Duration,
    ) -> Self {
        FirestoreStore::with_base_url(client, FIRESTORE_URL, project_id, identities, poll_interval)
    }

    pub fn with_base_url(
        client: Client,
        base_url: &str,
        project_id: &str,
        identities: watch::Receiver<Option<Identity>>,
        poll_interval: Duration,
    ) -> Self {
        FirestoreStore {
            client,
            documents_url: format!(
                "{}/projects/{}/databases/(default)/documents",
                base_url.trim_end_matches('/'),
                project_id
            ),
            identities,
            poll_interval,
        }
    }

    fn profile_url(&self, user: &UserId) -> String {
        format!("{}/users/{}", self.documents_url, user)
    }

    fn tasks_url(&self, user: &UserId) -> String {
        format!("{}/users/{}/tasks", self.documents_url, user)
    }

    fn authorized(&self, request: RequestBuilder, user: &UserId) -> Result<RequestBuilder, StoreError> {
        let identities = self.identities.borrow();
        match identities.as_ref() {
            Some(identity) if &identity.uid == user => match &identity.id_token {
                Some(token) => Ok(request.bearer_auth(token)),
                None => Err(StoreError::Unauthenticated),
            },
            _ => Err(StoreError::Unauthenticated),
        }
    }

    async fn list_tasks(&self, user: &UserId) -> Result<Snapshot, StoreError> {
        let url = self.tasks_url(user);
        let mut tasks = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("pageSize", PAGE_SIZE.to_string())];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }
            let request = self.authorized(self.client.get(&url).query(&query), user)?;
            let page = check(request.send().await?)
                .await?
                .json::<ListResponse>()
                .await?;

            for doc in &page.documents {
                tasks.push(decode_task(doc)?);
            }
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(tasks)
    }
}

/// Turns a non-success response into a [`StoreError`].
async fn check(res: Response) -> Result<Response, StoreError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(classify(status, body))
}

fn classify(status: StatusCode, body: String) -> StoreError {
    let (message, code) = match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => (envelope.error.message, envelope.error.status),
        Err(_) => (body, String::new()),
    };

    match (status, code.as_str()) {
        (StatusCode::CONFLICT, _) | (_, "ALREADY_EXISTS") | (_, "FAILED_PRECONDITION") => {
            StoreError::AlreadyExists(message)
        }
        (StatusCode::NOT_FOUND, _) => StoreError::NotFound(message),
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) => {
            StoreError::PermissionDenied(message)
        }
        (other, _) => StoreError::Status {
            status: other.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl DocumentStore for FirestoreStore {
    async fn get_profile(&self, user: &UserId) -> Result<Option<Profile>, StoreError> {
        let request = self.authorized(self.client.get(self.profile_url(user)), user)?;
        let res = request.send().await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let doc = check(res).await?.json::<Document>().await?;
        decode_profile(&doc).map(Some)
    }

    async fn create_profile(&self, user: &UserId, profile: &Profile) -> Result<bool, StoreError> {
        let request = self
            .client
            .patch(self.profile_url(user))
            .query(&[("currentDocument.exists", "false")])
            .json(&encode_profile(profile));
        match check(self.authorized(request, user)?.send().await?).await {
            Ok(_) => Ok(true),
            Err(StoreError::AlreadyExists(message)) => {
                debug!(uid = %user, %message, "profile already present");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn subscribe(&self, user: &UserId) -> Result<Subscription, StoreError> {
        let first = self.list_tasks(user).await?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = sender.send(Ok(first.clone()));

        let store = self.clone();
        let user = user.clone();
        let poller = tokio::spawn(async move {
            let mut last: Option<Vec<Task>> = Some(first);
            loop {
                tokio::time::sleep(store.poll_interval).await;
                if sender.is_closed() {
                    break;
                }
                match store.list_tasks(&user).await {
                    Ok(tasks) => {
                        if last.as_ref() != Some(&tasks) {
                            debug!(uid = %user, count = tasks.len(), "collection changed");
                            last = Some(tasks.clone());
                            if sender.send(Ok(tasks)).is_err() {
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        warn!(uid = %user, error = %err, "polling task collection failed");
                        last = None;
                        if sender.send(Err(err)).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Subscription::new(receiver, move || poller.abort()))
    }

    async fn create_task(&self, user: &UserId, task: &NewTask) -> Result<TaskId, StoreError> {
        let request = self
            .client
            .post(self.tasks_url(user))
            .json(&encode_new_task(task));
        let doc = check(self.authorized(request, user)?.send().await?)
            .await?
            .json::<Document>()
            .await?;
        Ok(TaskId::new(doc.id()))
    }

    async fn update_task(
        &self,
        user: &UserId,
        id: &TaskId,
        patch: &TaskPatch,
    ) -> Result<(), StoreError> {
        let (body, mask) = encode_patch(patch);
        let mut query: Vec<(&str, &str)> = mask
            .into_iter()
            .map(|field| ("updateMask.fieldPaths", field))
            .collect();
        query.push(("currentDocument.exists", "true"));

        let request = self
            .client
            .patch(format!("{}/{}", self.tasks_url(user), id))
            .query(&query)
            .json(&body);
        check(self.authorized(request, user)?.send().await?).await?;
        Ok(())
    }

    async fn delete_task(&self, user: &UserId, id: &TaskId) -> Result<(), StoreError> {
        let request = self
            .client
            .delete(format!("{}/{}", self.tasks_url(user), id));
        check(self.authorized(request, user)?.send().await?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(identity: Option<Identity>) -> FirestoreStore {
        let (_tx, rx) = watch::channel(identity);
        FirestoreStore::new(Client::new(), "demo-project", rx, Duration::from_secs(2))
    }

    #[test]
    fn test_document_urls() {
        let store = store(None);
        let user = UserId::new("u1");
        assert_eq!(
            store.tasks_url(&user),
            "https://firestore.googleapis.com/v1/projects/demo-project/databases/(default)/documents/users/u1/tasks"
        );
        assert!(store.profile_url(&user).ends_with("/documents/users/u1"));
    }

    #[test]
    fn test_requests_need_matching_token() {
        let user = UserId::new("u1");
        let signed_in = Identity::new(user.clone(), "u@example.com").with_token("tok");

        let store_a = store(Some(signed_in.clone()));
        assert!(store_a.authorized(store_a.client.get("http://x"), &user).is_ok());
        assert!(matches!(
            store_a.authorized(store_a.client.get("http://x"), &UserId::new("other")),
            Err(StoreError::Unauthenticated)
        ));

        let store_b = store(Some(Identity::new(user.clone(), "u@example.com")));
        assert!(matches!(
            store_b.authorized(store_b.client.get("http://x"), &user),
            Err(StoreError::Unauthenticated)
        ));

        let store_c = store(None);
        assert!(store_c.authorized(store_c.client.get("http://x"), &user).is_err());
    }

    #[test]
    fn test_existing_profile_precondition_is_recognised() {
        let conflict = r#"{"error":{"code":409,"message":"Document already exists: users/u1","status":"ALREADY_EXISTS"}}"#;
        assert!(matches!(
            classify(StatusCode::CONFLICT, conflict.to_string()),
            StoreError::AlreadyExists(message) if message.contains("users/u1")
        ));

        let precondition = r#"{"error":{"code":400,"message":"no match","status":"FAILED_PRECONDITION"}}"#;
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, precondition.to_string()),
            StoreError::AlreadyExists(_)
        ));
    }

    #[test]
    fn test_error_bodies_map_to_store_errors() {
        let denied = r#"{"error":{"code":403,"message":"Missing or insufficient permissions.","status":"PERMISSION_DENIED"}}"#;
        assert_eq!(
            classify(StatusCode::FORBIDDEN, denied.to_string()),
            StoreError::PermissionDenied("Missing or insufficient permissions.".to_string())
        );
        assert_eq!(
            classify(StatusCode::BAD_GATEWAY, "upstream down".to_string()),
            StoreError::Status {
                status: 502,
                message: "upstream down".to_string()
            }
        );
    }
}
