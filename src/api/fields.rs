//! Firestore typed-value encoding for task and profile documents.

use crate::models::{NewTask, Profile, Task, TaskId, TaskPatch};
use crate::store::StoreError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
pub struct Document {
    pub name: String,
    #[serde(default)]
    pub fields: HashMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    #[serde(default)]
    pub documents: Vec<Document>,
    pub next_page_token: Option<String>,
}

impl Document {
    /// Last path segment of the document name.
    pub fn id(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or_default()
    }

    fn string(&self, field: &str) -> Option<String> {
        self.fields
            .get(field)?
            .get("stringValue")?
            .as_str()
            .map(str::to_string)
    }

    fn boolean(&self, field: &str) -> Option<bool> {
        self.fields.get(field)?.get("booleanValue")?.as_bool()
    }

    fn timestamp(&self, field: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let Some(text) = self
            .fields
            .get(field)
            .and_then(|value| value.get("timestampValue"))
            .and_then(Value::as_str)
        else {
            return Ok(None);
        };
        DateTime::parse_from_rfc3339(text)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|err| StoreError::Decode(format!("{}: {}", field, err)))
    }
}

fn string_value(text: &str) -> Value {
    json!({ "stringValue": text })
}

fn timestamp_value(ts: Option<DateTime<Utc>>) -> Value {
    match ts {
        Some(ts) => json!({ "timestampValue": ts.to_rfc3339_opts(SecondsFormat::Millis, true) }),
        None => json!({ "nullValue": null }),
    }
}

/// Missing fields decode leniently: empty description, active status and
/// absent timestamps.
pub fn decode_task(doc: &Document) -> Result<Task, StoreError> {
    Ok(Task {
        id: TaskId::new(doc.id()),
        description: doc.string("description").unwrap_or_default(),
        status: doc.boolean("status").unwrap_or(false),
        created_at: doc.timestamp("createdAt")?,
        due_date: doc.timestamp("dueDate")?,
        modified_at: doc.timestamp("modifiedAt")?,
    })
}

pub fn encode_new_task(task: &NewTask) -> Value {
    json!({
        "fields": {
            "description": string_value(&task.description),
            "status": { "booleanValue": task.status },
            "createdAt": timestamp_value(Some(task.created_at)),
            "dueDate": timestamp_value(task.due_date),
        }
    })
}

/// Body plus the `updateMask.fieldPaths` to send with it.
pub fn encode_patch(patch: &TaskPatch) -> (Value, Vec<&'static str>) {
    let mut fields = Map::new();
    let mut mask = Vec::new();
    if let Some(description) = &patch.description {
        fields.insert("description".to_string(), string_value(description));
        mask.push("description");
    }
    if let Some(status) = patch.status {
        fields.insert("status".to_string(), json!({ "booleanValue": status }));
        mask.push("status");
    }
    if let Some(modified_at) = patch.modified_at {
        fields.insert("modifiedAt".to_string(), timestamp_value(Some(modified_at)));
        mask.push("modifiedAt");
    }
    (json!({ "fields": fields }), mask)
}

pub fn decode_profile(doc: &Document) -> Result<Profile, StoreError> {
    let created_at = doc
        .timestamp("createdAt")?
        .ok_or_else(|| StoreError::Decode("profile without createdAt".to_string()))?;
    Ok(Profile {
        email: doc.string("email").unwrap_or_default(),
        created_at,
    })
}

pub fn encode_profile(profile: &Profile) -> Value {
    json!({
        "fields": {
            "email": string_value(&profile.email),
            "createdAt": timestamp_value(Some(profile.created_at)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn document(value: Value) -> Document {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_decode_full_task() {
        let doc = document(json!({
            "name": "projects/p/databases/(default)/documents/users/u1/tasks/abc123",
            "fields": {
                "description": { "stringValue": "Buy milk" },
                "status": { "booleanValue": true },
                "createdAt": { "timestampValue": "2026-10-01T09:00:00.000Z" },
                "dueDate": { "nullValue": null },
                "modifiedAt": { "timestampValue": "2026-10-02T10:30:00Z" }
            },
            "createTime": "2026-10-01T09:00:00.123456Z"
        }));
        let task = decode_task(&doc).unwrap();

        assert_eq!(task.id, TaskId::new("abc123"));
        assert_eq!(task.description, "Buy milk");
        assert!(task.status);
        assert_eq!(
            task.created_at,
            Some(Utc.with_ymd_and_hms(2026, 10, 1, 9, 0, 0).unwrap())
        );
        assert_eq!(task.due_date, None);
        assert_eq!(
            task.modified_at,
            Some(Utc.with_ymd_and_hms(2026, 10, 2, 10, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_decode_sparse_task() {
        let doc = document(json!({ "name": "users/u1/tasks/t9" }));
        let task = decode_task(&doc).unwrap();
        assert_eq!(task.description, "");
        assert!(!task.status);
        assert_eq!(task.created_at, None);
    }

    #[test]
    fn test_decode_bad_timestamp() {
        let doc = document(json!({
            "name": "users/u1/tasks/t9",
            "fields": { "createdAt": { "timestampValue": "yesterday" } }
        }));
        assert!(matches!(decode_task(&doc), Err(StoreError::Decode(_))));
    }

    #[test]
    fn test_encode_new_task() {
        let task = NewTask {
            description: "Call mom".to_string(),
            status: false,
            created_at: Utc.with_ymd_and_hms(2026, 10, 17, 8, 0, 0).unwrap(),
            due_date: None,
        };
        let body = encode_new_task(&task);
        assert_eq!(body["fields"]["description"]["stringValue"], "Call mom");
        assert_eq!(body["fields"]["status"]["booleanValue"], false);
        assert_eq!(
            body["fields"]["createdAt"]["timestampValue"],
            "2026-10-17T08:00:00.000Z"
        );
        assert!(body["fields"]["dueDate"]["nullValue"].is_null());
        assert!(body["fields"]["dueDate"].get("nullValue").is_some());
    }

    #[test]
    fn test_encode_patch_masks_present_fields() {
        let (body, mask) = encode_patch(&TaskPatch::status(true));
        assert_eq!(mask, vec!["status"]);
        assert_eq!(body["fields"]["status"]["booleanValue"], true);
        assert!(body["fields"].get("description").is_none());

        let at = Utc.with_ymd_and_hms(2026, 10, 17, 8, 0, 0).unwrap();
        let (_, mask) = encode_patch(&TaskPatch::description("New text", at));
        assert_eq!(mask, vec!["description", "modifiedAt"]);
    }

    #[test]
    fn test_profile_encoding() {
        let profile = Profile {
            email: "u@example.com".to_string(),
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        };
        let body = encode_profile(&profile);
        let doc = document(json!({ "name": "users/u1", "fields": body["fields"].clone() }));
        assert_eq!(decode_profile(&doc).unwrap(), profile);
    }
}
