//! Task store client.
//!
//! Holds the in-memory copy of one user's task collection and keeps it in step
//! with the document store. Every pushed snapshot replaces the whole list.
//! Toggles and deletes are applied locally before the store confirms them and
//! are rolled back if the store rejects them; creates and edits only show up
//! once the next snapshot arrives.
//!
//! The list is written only from here. Readers get clones via [`TaskStore::state`]
//! or borrow through a [`watch::Receiver`].

pub mod optimistic;

use crate::models::{Identity, NewTask, Profile, Task, TaskId, TaskPatch};
use crate::session::SessionState;
use crate::store::{DocumentStore, StoreError, Subscription, SubscriptionHandle};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use futures::StreamExt;
use optimistic::Optimistic;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a toggle waits for a task it has not seen yet.
const PENDING_TASK_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Task description cannot be empty.")]
    EmptyDescription,
    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Unsubscribed,
    Subscribing,
    Live,
}

/// Where the message in the error slot came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Profile,
    Feed,
    Mutation,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskListState {
    pub phase: Phase,
    pub tasks: Vec<Task>,
    pub last_error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl TaskListState {
    fn fail(&mut self, kind: ErrorKind, message: String) {
        self.last_error = Some(message);
        self.error_kind = Some(kind);
    }

    fn clear_error(&mut self) {
        self.last_error = None;
        self.error_kind = None;
    }
}

struct Active {
    identity: Identity,
    generation: u64,
    subscription: Option<SubscriptionHandle>,
    pump: Option<JoinHandle<()>>,
}

impl Active {
    fn stop(self) {
        if let Some(subscription) = self.subscription {
            subscription.cancel();
        }
        if let Some(pump) = self.pump {
            pump.abort();
        }
    }
}

struct Inner {
    backend: Arc<dyn DocumentStore>,
    state: watch::Sender<TaskListState>,
    active: Mutex<Option<Active>>,
    generations: AtomicU64,
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|active| active.generation == generation)
    }

    /// Applies `f` only while `generation` is still the connected one, so
    /// results landing after a disconnect are dropped.
    fn modify_if_current(&self, generation: u64, f: impl FnOnce(&mut TaskListState)) -> bool {
        let active = self.active.lock();
        if active.as_ref().map(|a| a.generation) != Some(generation) {
            return false;
        }
        self.state.send_modify(f);
        true
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.stop();
        }
    }
}

#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<Inner>,
}

impl TaskStore {
    pub fn new(backend: Arc<dyn DocumentStore>) -> Self {
        let (state, _) = watch::channel(TaskListState::default());
        TaskStore {
            inner: Arc::new(Inner {
                backend,
                state,
                active: Mutex::new(None),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> TaskListState {
        self.inner.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<TaskListState> {
        self.inner.state.subscribe()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.inner.state.borrow().tasks.clone()
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.borrow().phase
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.state.borrow().last_error.clone()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|active| active.identity.clone())
    }

    fn current(&self) -> Option<(Identity, u64)> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|active| (active.identity.clone(), active.generation))
    }

    /// Binds the store to `identity`: makes sure the profile exists, then
    /// opens the live feed. Any previous binding is torn down first. The list
    /// survives a reconnect for the same user and is cleared for a new one.
    pub async fn connect(&self, identity: Identity) {
        let previous = self.inner.active.lock().take();
        let same_user = previous
            .as_ref()
            .is_some_and(|active| active.identity.uid == identity.uid);
        if let Some(previous) = previous {
            previous.stop();
        }

        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        *self.inner.active.lock() = Some(Active {
            identity: identity.clone(),
            generation,
            subscription: None,
            pump: None,
        });
        self.inner.modify_if_current(generation, |s| {
            s.phase = Phase::Subscribing;
            if !same_user {
                s.tasks.clear();
                s.clear_error();
            }
        });
        info!(user = %identity.uid, generation, "connecting task store");

        if let Err(err) = self.ensure_profile(&identity).await {
            warn!(%err, user = %identity.uid, "profile bootstrap failed");
            self.inner.modify_if_current(generation, |s| {
                s.fail(
                    ErrorKind::Profile,
                    format!("Error setting up user profile: {}.", err),
                )
            });
        }
        if !self.inner.is_current(generation) {
            return;
        }

        match self.inner.backend.subscribe(&identity.uid).await {
            Ok(subscription) => self.start_pump(generation, subscription),
            Err(err) => {
                warn!(%err, user = %identity.uid, "opening task feed failed");
                self.inner.modify_if_current(generation, |s| {
                    s.phase = Phase::Unsubscribed;
                    s.fail(ErrorKind::Feed, format!("Error fetching tasks: {}.", err));
                });
            }
        }
    }

    /// Re-opens the feed for the current identity, e.g. after it failed.
    pub async fn reconnect(&self) {
        if let Some(identity) = self.identity() {
            self.connect(identity).await;
        }
    }

    /// Releases the feed and clears the list. In-flight mutations finish but
    /// no longer touch local state.
    pub fn disconnect(&self) {
        let previous = self.inner.active.lock().take();
        if let Some(active) = previous {
            info!(user = %active.identity.uid, "disconnecting task store");
            active.stop();
            self.inner
                .state
                .send_modify(|s| *s = TaskListState::default());
        }
    }

    /// Connects, disconnects or does nothing so that the store follows `user`.
    /// A refreshed identity for the same uid keeps the feed and only swaps the
    /// stored identity.
    pub async fn sync_identity(&self, user: Option<Identity>) {
        match user {
            None => self.disconnect(),
            Some(identity) => {
                let same_user = {
                    let mut active = self.inner.active.lock();
                    match active.as_mut() {
                        Some(current) if current.identity.uid == identity.uid => {
                            current.identity = identity.clone();
                            true
                        }
                        _ => false,
                    }
                };
                if !same_user {
                    self.connect(identity).await;
                }
            }
        }
    }

    /// Keeps the store bound to whoever the session says is signed in.
    pub fn follow(&self, mut sessions: watch::Receiver<SessionState>) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                let user = sessions.borrow_and_update().current_user.clone();
                store.sync_identity(user).await;
                if sessions.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// Creates the profile document if it does not exist yet. Returns whether
    /// it was created. An existing profile is never rewritten.
    pub async fn ensure_profile(&self, identity: &Identity) -> Result<bool, StoreError> {
        let backend = &self.inner.backend;
        if backend.get_profile(&identity.uid).await?.is_some() {
            debug!(user = %identity.uid, "profile already exists");
            return Ok(false);
        }
        let profile = Profile {
            email: identity.email.clone(),
            created_at: Utc::now(),
        };
        let created = backend.create_profile(&identity.uid, &profile).await?;
        if created {
            info!(user = %identity.uid, "created user profile");
        } else {
            debug!(user = %identity.uid, "profile appeared concurrently");
        }
        Ok(created)
    }

    fn holds(&self, id: &TaskId) -> bool {
        self.inner.state.borrow().tasks.iter().any(|task| &task.id == id)
    }

    /// Waits for a just-created task to arrive with a snapshot. `false` on
    /// timeout or once the feed is torn down.
    async fn arrival(&self, generation: u64, id: &TaskId) -> bool {
        let mut changes = self.inner.state.subscribe();
        let seen = tokio::time::timeout(
            PENDING_TASK_WAIT,
            changes.wait_for(|s| {
                s.phase == Phase::Unsubscribed || s.tasks.iter().any(|task| &task.id == id)
            }),
        )
        .await;
        let arrived = match seen {
            Ok(Ok(state)) => state.tasks.iter().any(|task| &task.id == id),
            _ => false,
        };
        arrived && self.inner.is_current(generation)
    }

    fn start_pump(&self, generation: u64, subscription: Subscription) {
        let handle = subscription.handle();
        let mut active = self.inner.active.lock();
        let Some(current) = active.as_mut().filter(|a| a.generation == generation) else {
            debug!(generation, "store moved on before the feed opened");
            return;
        };
        self.inner.state.send_modify(|s| s.phase = Phase::Live);
        let pump = tokio::spawn(pump(Arc::downgrade(&self.inner), generation, subscription));
        current.subscription = Some(handle);
        current.pump = Some(pump);
    }

    /// Submits a new task. The list picks it up from the next snapshot.
    /// Returns `Ok(None)` when nobody is signed in.
    pub async fn add_task(
        &self,
        description: &str,
        due_date: Option<NaiveDateTime>,
        include_time: bool,
    ) -> Result<Option<TaskId>, SyncError> {
        let description = description.trim();
        if description.is_empty() {
            return Err(SyncError::EmptyDescription);
        }
        let Some((identity, generation)) = self.current() else {
            debug!("add_task ignored: not signed in");
            return Ok(None);
        };

        match self
            .create(&identity, description, due_date, include_time)
            .await
        {
            Ok(id) => {
                info!(%id, "task created");
                self.inner.modify_if_current(generation, TaskListState::clear_error);
                Ok(Some(id))
            }
            Err(err) => {
                warn!(%err, "creating task failed");
                self.inner.modify_if_current(generation, |s| {
                    s.fail(ErrorKind::Mutation, format!("Error adding task: {}.", err))
                });
                Err(err.into())
            }
        }
    }

    async fn create(
        &self,
        identity: &Identity,
        description: &str,
        due_date: Option<NaiveDateTime>,
        include_time: bool,
    ) -> Result<TaskId, StoreError> {
        self.ensure_profile(identity).await?;
        let task = NewTask {
            description: description.to_string(),
            status: false,
            created_at: Utc::now(),
            due_date: due_date.and_then(|due| normalize_due(due, include_time, &Local)),
        };
        self.inner.backend.create_task(&identity.uid, &task).await
    }

    /// Flips a task's status locally, then in the store. A rejected flip is
    /// reverted.
    pub async fn toggle_status(&self, id: &TaskId) -> Result<(), SyncError> {
        let Some((identity, generation)) = self.current() else {
            return Ok(());
        };
        if !self.holds(id) && !self.arrival(generation, id).await {
            return Err(SyncError::UnknownTask(id.clone()));
        }
        let mut pending = None;
        self.inner.modify_if_current(generation, |s| {
            pending = Optimistic::toggle(&mut s.tasks, id);
        });
        let Some(mut pending) = pending else {
            return Err(SyncError::UnknownTask(id.clone()));
        };
        let Some(status) = pending.target_status() else {
            return Err(SyncError::UnknownTask(id.clone()));
        };

        let patch = TaskPatch::status(status);
        match self.inner.backend.update_task(&identity.uid, id, &patch).await {
            Ok(()) => {
                pending.confirm();
                debug!(%id, status, "toggle confirmed");
                self.inner.modify_if_current(generation, TaskListState::clear_error);
                Ok(())
            }
            Err(err) => {
                warn!(%err, %id, "toggle rejected, rolling back");
                self.inner.modify_if_current(generation, |s| {
                    pending.roll_back(&mut s.tasks);
                    s.fail(ErrorKind::Mutation, format!("Error updating task: {}.", err));
                });
                Err(err.into())
            }
        }
    }

    /// Saves an edited description and stamps `modified_at`. Not applied
    /// locally; the edit appears with the next snapshot.
    pub async fn update_description(&self, id: &TaskId, text: &str) -> Result<(), SyncError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SyncError::EmptyDescription);
        }
        let Some((identity, generation)) = self.current() else {
            return Ok(());
        };

        let patch = TaskPatch::description(text, Utc::now());
        match self.inner.backend.update_task(&identity.uid, id, &patch).await {
            Ok(()) => {
                debug!(%id, "description updated");
                self.inner.modify_if_current(generation, TaskListState::clear_error);
                Ok(())
            }
            Err(err) => {
                warn!(%err, %id, "updating description failed");
                self.inner.modify_if_current(generation, |s| {
                    s.fail(ErrorKind::Mutation, format!("Error updating task: {}.", err))
                });
                Err(err.into())
            }
        }
    }

    /// Removes a task locally, then in the store. A rejected delete puts the
    /// task back at the end of the list. A task not yet in the list is still
    /// deleted in the store.
    pub async fn delete_task(&self, id: &TaskId) -> Result<(), SyncError> {
        let Some((identity, generation)) = self.current() else {
            return Ok(());
        };
        let mut pending = None;
        self.inner.modify_if_current(generation, |s| {
            pending = Optimistic::delete(&mut s.tasks, id);
        });

        match self.inner.backend.delete_task(&identity.uid, id).await {
            Ok(()) => {
                if let Some(pending) = pending.as_mut() {
                    pending.confirm();
                }
                info!(%id, "task deleted");
                self.inner.modify_if_current(generation, TaskListState::clear_error);
                Ok(())
            }
            Err(err) => {
                warn!(%err, %id, "delete rejected, restoring task");
                self.inner.modify_if_current(generation, |s| {
                    if let Some(pending) = pending.as_mut() {
                        pending.roll_back(&mut s.tasks);
                    }
                    s.fail(ErrorKind::Mutation, format!("Error deleting task: {}.", err));
                });
                Err(err.into())
            }
        }
    }
}

async fn pump(inner: Weak<Inner>, generation: u64, mut subscription: Subscription) {
    while let Some(event) = subscription.next().await {
        let Some(store) = inner.upgrade() else {
            break;
        };
        let applied = match event {
            Ok(tasks) => {
                debug!(generation, count = tasks.len(), "snapshot received");
                store.modify_if_current(generation, |s| {
                    s.tasks = tasks;
                    if s.error_kind == Some(ErrorKind::Feed) {
                        s.clear_error();
                    }
                })
            }
            Err(err) => {
                warn!(%err, generation, "task feed error, keeping last list");
                store.modify_if_current(generation, |s| {
                    s.fail(ErrorKind::Feed, format!("Error fetching tasks: {}.", err))
                })
            }
        };
        if !applied {
            break;
        }
    }
    debug!(generation, "task feed closed");
}

/// Converts a picked due date to UTC. Without a time the date is pinned to the
/// start of that day in `tz`.
pub fn normalize_due<Tz: TimeZone>(
    due: NaiveDateTime,
    include_time: bool,
    tz: &Tz,
) -> Option<DateTime<Utc>> {
    let local = if include_time {
        due
    } else {
        due.date().and_hms_opt(0, 0, 0)?
    };
    // A wall-clock time skipped by a DST jump moves forward past the gap.
    (0..=4)
        .map(|step| local + chrono::Duration::minutes(30 * step))
        .find_map(|candidate| tz.from_local_datetime(&candidate).earliest())
        .map(|at| at.with_timezone(&Utc))
}
