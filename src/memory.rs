//! In-process backends used for the offline demo mode and in tests.
//!
//! [`MemoryStore`] keeps every user's collection in memory and pushes a fresh
//! snapshot to live listeners after each change. Failures can be injected one
//! operation at a time, and an artificial latency makes the optimistic window
//! visible.

use crate::models::{Identity, NewTask, Profile, Task, TaskId, TaskPatch, UserId};
use crate::session::{AuthError, IdentityProvider};
use crate::store::{DocumentStore, SnapshotResult, StoreError, Subscription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    GetProfile,
    CreateProfile,
    Subscribe,
    CreateTask,
    UpdateTask,
    DeleteTask,
}

struct Listener {
    id: u64,
    sender: mpsc::UnboundedSender<SnapshotResult>,
}

#[derive(Default)]
struct MemoryState {
    profiles: HashMap<UserId, Profile>,
    tasks: HashMap<UserId, Vec<Task>>,
    listeners: HashMap<UserId, Vec<Listener>>,
    next_listener: u64,
    failures: HashMap<Operation, VecDeque<String>>,
}

impl MemoryState {
    fn take_failure(&mut self, op: Operation) -> Result<(), StoreError> {
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(message) => Err(StoreError::Unavailable(message)),
            None => Ok(()),
        }
    }

    fn broadcast(&mut self, user: &UserId) {
        let snapshot = self.tasks.get(user).cloned().unwrap_or_default();
        if let Some(listeners) = self.listeners.get_mut(user) {
            listeners.retain(|listener| listener.sender.send(Ok(snapshot.clone())).is_ok());
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    latency: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Every call sleeps this long before touching state.
    pub fn with_latency(latency: Duration) -> Self {
        MemoryStore {
            latency,
            ..MemoryStore::default()
        }
    }

    /// Makes the next call of `op` fail with `message`. Calls queue up.
    pub fn fail_next(&self, op: Operation, message: impl Into<String>) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(message.into());
    }

    /// Delivers a feed error to every live listener of `user`.
    pub fn push_error(&self, user: &UserId, message: impl Into<String>) {
        let error = StoreError::Unavailable(message.into());
        if let Some(listeners) = self.state.lock().listeners.get_mut(user) {
            listeners.retain(|listener| listener.sender.send(Err(error.clone())).is_ok());
        }
    }

    /// Replaces a user's collection wholesale and notifies listeners, as if
    /// another device had written it.
    pub fn replace_tasks(&self, user: &UserId, tasks: Vec<Task>) {
        let mut state = self.state.lock();
        state.tasks.insert(user.clone(), tasks);
        state.broadcast(user);
    }

    pub fn tasks(&self, user: &UserId) -> Vec<Task> {
        self.state.lock().tasks.get(user).cloned().unwrap_or_default()
    }

    pub fn profile(&self, user: &UserId) -> Option<Profile> {
        self.state.lock().profiles.get(user).cloned()
    }

    pub fn listener_count(&self, user: &UserId) -> usize {
        self.state
            .lock()
            .listeners
            .get(user)
            .map_or(0, |listeners| listeners.iter().filter(|l| !l.sender.is_closed()).count())
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_profile(&self, user: &UserId) -> Result<Option<Profile>, StoreError> {
        self.delay().await;
        let mut state = self.state.lock();
        state.take_failure(Operation::GetProfile)?;
        Ok(state.profiles.get(user).cloned())
    }

    async fn create_profile(&self, user: &UserId, profile: &Profile) -> Result<bool, StoreError> {
        self.delay().await;
        let mut state = self.state.lock();
        state.take_failure(Operation::CreateProfile)?;
        match state.profiles.entry(user.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(profile.clone());
                Ok(true)
            }
        }
    }

    async fn subscribe(&self, user: &UserId) -> Result<Subscription, StoreError> {
        self.delay().await;
        let mut state = self.state.lock();
        state.take_failure(Operation::Subscribe)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let snapshot = state.tasks.get(user).cloned().unwrap_or_default();
        // Receiver is alive, so the first send cannot fail.
        let _ = sender.send(Ok(snapshot));

        let id = state.next_listener;
        state.next_listener += 1;
        state
            .listeners
            .entry(user.clone())
            .or_default()
            .push(Listener { id, sender });
        debug!(%user, listener = id, "memory listener added");

        let registry = Arc::downgrade(&self.state);
        let user = user.clone();
        Ok(Subscription::new(receiver, move || {
            if let Some(registry) = registry.upgrade() {
                if let Some(listeners) = registry.lock().listeners.get_mut(&user) {
                    listeners.retain(|listener| listener.id != id);
                }
                debug!(%user, listener = id, "memory listener removed");
            }
        }))
    }

    async fn create_task(&self, user: &UserId, task: &NewTask) -> Result<TaskId, StoreError> {
        self.delay().await;
        let mut state = self.state.lock();
        state.take_failure(Operation::CreateTask)?;

        let id = TaskId::new(Uuid::new_v4().simple().to_string());
        state
            .tasks
            .entry(user.clone())
            .or_default()
            .push(task.clone().into_task(id.clone()));
        state.broadcast(user);
        Ok(id)
    }

    async fn update_task(
        &self,
        user: &UserId,
        id: &TaskId,
        patch: &TaskPatch,
    ) -> Result<(), StoreError> {
        self.delay().await;
        let mut state = self.state.lock();
        state.take_failure(Operation::UpdateTask)?;

        let task = state
            .tasks
            .get_mut(user)
            .and_then(|tasks| tasks.iter_mut().find(|task| &task.id == id))
            .ok_or_else(|| StoreError::NotFound(format!("users/{}/tasks/{}", user, id)))?;
        patch.apply(task);
        state.broadcast(user);
        Ok(())
    }

    async fn delete_task(&self, user: &UserId, id: &TaskId) -> Result<(), StoreError> {
        self.delay().await;
        let mut state = self.state.lock();
        state.take_failure(Operation::DeleteTask)?;

        if let Some(tasks) = state.tasks.get_mut(user) {
            tasks.retain(|task| &task.id != id);
        }
        state.broadcast(user);
        Ok(())
    }
}

struct Account {
    uid: UserId,
    password: String,
}

/// Email/password accounts kept in memory.
pub struct MemoryAuth {
    accounts: Mutex<HashMap<String, Account>>,
    current: watch::Sender<Option<Identity>>,
}

impl MemoryAuth {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        MemoryAuth {
            accounts: Mutex::new(HashMap::new()),
            current,
        }
    }
}

impl Default for MemoryAuth {
    fn default() -> Self {
        MemoryAuth::new()
    }
}

#[async_trait]
impl IdentityProvider for MemoryAuth {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        let email = email.trim().to_lowercase();
        let identity = {
            let accounts = self.accounts.lock();
            match accounts.get(&email) {
                Some(account) if account.password == password => {
                    Identity::new(account.uid.clone(), email)
                }
                _ => return Err(AuthError::InvalidCredentials),
            }
        };
        self.current.send_replace(Some(identity.clone()));
        Ok(identity)
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        let email = email.trim().to_lowercase();
        if !email.contains('@') {
            return Err(AuthError::InvalidEmail);
        }
        if password.chars().count() < 6 {
            return Err(AuthError::WeakPassword);
        }

        let identity = {
            let mut accounts = self.accounts.lock();
            if accounts.contains_key(&email) {
                return Err(AuthError::EmailInUse);
            }
            let uid = UserId::new(Uuid::new_v4().simple().to_string());
            accounts.insert(
                email.clone(),
                Account {
                    uid: uid.clone(),
                    password: password.to_string(),
                },
            );
            Identity::new(uid, email)
        };
        self.current.send_replace(Some(identity.clone()));
        Ok(identity)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.current.send_replace(None);
        Ok(())
    }

    fn identity_changes(&self) -> watch::Receiver<Option<Identity>> {
        self.current.subscribe()
    }
}
