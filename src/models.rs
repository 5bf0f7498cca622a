use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// Store-assigned task id
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        TaskId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Stable id of an authenticated account
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        UserId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Task struct
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    /// `false` while active, `true` once completed.
    pub status: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Fields sent to the store when creating a task. The id comes back from the
/// store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewTask {
    pub description: String,
    pub status: bool,
    pub created_at: DateTime<Utc>,
    pub due_date: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn into_task(self, id: TaskId) -> Task {
        Task {
            id,
            description: self.description,
            status: self.status,
            created_at: Some(self.created_at),
            due_date: self.due_date,
            modified_at: None,
        }
    }
}

/// Partial update of a stored task. `None` fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskPatch {
    pub description: Option<String>,
    pub status: Option<bool>,
    pub modified_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn status(status: bool) -> Self {
        TaskPatch {
            status: Some(status),
            ..TaskPatch::default()
        }
    }

    pub fn description(description: impl Into<String>, modified_at: DateTime<Utc>) -> Self {
        TaskPatch {
            description: Some(description.into()),
            modified_at: Some(modified_at),
            ..TaskPatch::default()
        }
    }

    pub fn apply(&self, task: &mut Task) {
        if let Some(description) = &self.description {
            task.description = description.clone();
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(modified_at) = self.modified_at {
            task.modified_at = Some(modified_at);
        }
    }
}

// Per-user profile document
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Profile {
    pub email: String,
    pub created_at: DateTime<Utc>,
}

/// An authenticated account as reported by the identity provider.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: UserId,
    pub email: String,
    /// Bearer token for the document store, when the provider issues one.
    pub id_token: Option<String>,
}

impl Identity {
    pub fn new(uid: UserId, email: impl Into<String>) -> Self {
        Identity {
            uid,
            email: email.into(),
            id_token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.id_token = Some(token.into());
        self
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("uid", &self.uid)
            .field("email", &self.email)
            .field("id_token", &self.id_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn task() -> Task {
        NewTask {
            description: "Buy milk".to_string(),
            status: false,
            created_at: Utc.with_ymd_and_hms(2026, 10, 1, 9, 0, 0).unwrap(),
            due_date: None,
        }
        .into_task(TaskId::new("t1"))
    }

    #[test]
    fn test_patch_only_touches_present_fields() {
        let mut task = task();
        TaskPatch::status(true).apply(&mut task);
        assert!(task.status);
        assert_eq!(task.description, "Buy milk");
        assert_eq!(task.modified_at, None);
    }

    #[test]
    fn test_description_patch_sets_modified_at() {
        let mut task = task();
        let at = Utc.with_ymd_and_hms(2026, 10, 2, 9, 0, 0).unwrap();
        TaskPatch::description("Buy oat milk", at).apply(&mut task);
        assert_eq!(task.description, "Buy oat milk");
        assert_eq!(task.modified_at, Some(at));
        assert!(!task.status);
    }

    #[test]
    fn test_identity_debug_hides_token() {
        let identity = Identity::new(UserId::new("u1"), "u@example.com").with_token("secret");
        let rendered = format!("{:?}", identity);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("u@example.com"));
    }
}
