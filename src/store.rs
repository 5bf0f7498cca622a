//! Document store boundary.
//!
//! Tasks live in a per-user collection (`users/{uid}/tasks/{id}`) next to the
//! user's profile document (`users/{uid}`). A [`Subscription`] delivers full
//! collection snapshots until it is cancelled or dropped.

use crate::models::{NewTask, Profile, Task, TaskId, TaskPatch, UserId};
use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;

/// Full point-in-time listing of one user's tasks.
pub type Snapshot = Vec<Task>;

pub type SnapshotResult = Result<Snapshot, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("network error: {0}")]
    Network(String),
    #[error("{message} (status {status})")]
    Status { status: u16, message: String },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("document already exists: {0}")]
    AlreadyExists(String),
    #[error("malformed document: {0}")]
    Decode(String),
    #[error("not signed in")]
    Unauthenticated,
    #[error("{0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            StoreError::Decode(err.to_string())
        } else {
            StoreError::Network(err.to_string())
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_profile(&self, user: &UserId) -> Result<Option<Profile>, StoreError>;

    /// Writes the profile only if none exists yet. `Ok(false)` when another
    /// writer got there first; the stored profile is left untouched.
    async fn create_profile(&self, user: &UserId, profile: &Profile) -> Result<bool, StoreError>;

    /// Opens a live feed of the user's task collection. The first item is the
    /// current contents.
    async fn subscribe(&self, user: &UserId) -> Result<Subscription, StoreError>;

    async fn create_task(&self, user: &UserId, task: &NewTask) -> Result<TaskId, StoreError>;

    async fn update_task(
        &self,
        user: &UserId,
        id: &TaskId,
        patch: &TaskPatch,
    ) -> Result<(), StoreError>;

    async fn delete_task(&self, user: &UserId, id: &TaskId) -> Result<(), StoreError>;
}

type CancelFn = Box<dyn FnOnce() + Send>;

/// Cancels a subscription from outside the task that consumes it. Cancelling
/// is idempotent and takes effect immediately: the backend drops its sender,
/// so the stream ends after any already-queued items.
#[derive(Clone)]
pub struct SubscriptionHandle {
    cancel: Arc<Mutex<Option<CancelFn>>>,
}

impl SubscriptionHandle {
    pub fn cancel(&self) {
        let cancel = self.cancel.lock().take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.lock().is_none()
    }
}

/// Live feed of snapshots. Dropping it unsubscribes.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<SnapshotResult>,
    handle: SubscriptionHandle,
}

impl Subscription {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<SnapshotResult>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Subscription {
            receiver,
            handle: SubscriptionHandle {
                cancel: Arc::new(Mutex::new(Some(Box::new(cancel)))),
            },
        }
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    pub fn unsubscribe(self) {
        self.handle.cancel();
    }
}

impl Stream for Subscription {
    type Item = SnapshotResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_subscription() -> (
        mpsc::UnboundedSender<SnapshotResult>,
        Subscription,
        Arc<AtomicUsize>,
    ) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cancelled);
        let subscription = Subscription::new(receiver, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (sender, subscription, cancelled)
    }

    #[tokio::test]
    async fn test_stream_yields_items_in_order() {
        let (sender, mut subscription, _) = counting_subscription();
        sender.send(Ok(vec![])).unwrap();
        sender
            .send(Err(StoreError::Unavailable("offline".to_string())))
            .unwrap();
        drop(sender);

        assert_eq!(subscription.next().await, Some(Ok(vec![])));
        assert_eq!(
            subscription.next().await,
            Some(Err(StoreError::Unavailable("offline".to_string())))
        );
        assert_eq!(subscription.next().await, None);
    }

    #[test]
    fn test_drop_cancels_once() {
        let (_sender, subscription, cancelled) = counting_subscription();
        let handle = subscription.handle();
        drop(subscription);
        handle.cancel();
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_handle_cancels_before_drop() {
        let (_sender, subscription, cancelled) = counting_subscription();
        subscription.handle().cancel();
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        subscription.unsubscribe();
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }
}
