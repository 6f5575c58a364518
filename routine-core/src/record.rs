//! Records and the offline sync state attached to them.
//!
//! Sync metadata lives beside the domain fields in [`SyncState`] and never
//! inside [`Record::fields`], so domain code can read and patch fields without
//! tripping over bookkeeping markers.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Domain fields of a record, keyed by field name.
pub type Fields = serde_json::Map<String, Value>;

/// Prefix of locally generated ids for records the backend has not seen yet.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Generate a temporary id: prefix, creation millis, random suffix.
///
/// The result is never a valid server id, see [`is_temp_id`].
#[must_use]
pub fn generate_temp_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{TEMP_ID_PREFIX}{}-{}", now_millis(), &suffix[..9])
}

/// Returns true for ids produced by [`generate_temp_id`].
#[must_use]
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Current timestamp in milliseconds since epoch.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Pending-mutation state of a record.
///
/// A record is in exactly one state. The transitions below keep the
/// "create excludes delete, update combines with neither" rule by folding
/// later edits into the stronger pending intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncState {
    /// In sync with the backend.
    #[default]
    Clean,
    /// Created locally, backend has not assigned an id yet.
    PendingCreate,
    /// Fields modified locally.
    PendingUpdate,
    /// Deleted locally; kept as a tombstone until reconciled.
    PendingDelete,
    /// Marked as the exclusive active record while offline.
    PendingActivation {
        /// Fields were also edited and must be pushed before the transition.
        fields_dirty: bool,
    },
    /// Exclusive active marker removed while offline.
    PendingDeactivation {
        /// Fields were also edited and must be pushed before the transition.
        fields_dirty: bool,
    },
}

impl SyncState {
    /// Returns true if the record is waiting for reconciliation.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        !matches!(self, Self::Clean)
    }

    /// Returns true for a local tombstone.
    #[must_use]
    pub const fn is_tombstone(self) -> bool {
        matches!(self, Self::PendingDelete)
    }

    /// State after a local field edit, or `None` if the record is deleted.
    #[must_use]
    pub const fn after_update(self) -> Option<Self> {
        match self {
            Self::Clean | Self::PendingUpdate => Some(Self::PendingUpdate),
            Self::PendingCreate => Some(Self::PendingCreate),
            Self::PendingActivation { .. } => Some(Self::PendingActivation { fields_dirty: true }),
            Self::PendingDeactivation { .. } => {
                Some(Self::PendingDeactivation { fields_dirty: true })
            }
            Self::PendingDelete => None,
        }
    }

    /// State after a local activation toggle, or `None` if the record is deleted.
    ///
    /// A pending create keeps its state: the created record carries the
    /// active field and the transition is pushed right after creation.
    #[must_use]
    pub const fn after_exclusive_toggle(self, active: bool) -> Option<Self> {
        let fields_dirty = match self {
            Self::PendingCreate => return Some(Self::PendingCreate),
            Self::PendingDelete => return None,
            Self::Clean => false,
            Self::PendingUpdate => true,
            Self::PendingActivation { fields_dirty }
            | Self::PendingDeactivation { fields_dirty } => fields_dirty,
        };
        if active {
            Some(Self::PendingActivation { fields_dirty })
        } else {
            Some(Self::PendingDeactivation { fields_dirty })
        }
    }

    /// Short label used in logs and metrics.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::PendingCreate => "pending_create",
            Self::PendingUpdate => "pending_update",
            Self::PendingDelete => "pending_delete",
            Self::PendingActivation { .. } => "pending_activation",
            Self::PendingDeactivation { .. } => "pending_deactivation",
        }
    }
}

/// A domain entity stored in one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Server id, or a temp id while [`SyncState::PendingCreate`].
    pub id: String,
    /// Domain fields. Never contains the `id` key.
    #[serde(default)]
    pub fields: Fields,
    /// Pending-mutation state.
    #[serde(default)]
    pub sync: SyncState,
    /// Millis of the last local write, stamped on critical collections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<u64>,
}

impl Record {
    /// Create a clean record, e.g. from a backend response.
    #[must_use]
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields: strip_id(fields),
            sync: SyncState::Clean,
            last_updated: None,
        }
    }

    /// Create a record that only exists locally, under a fresh temp id.
    #[must_use]
    pub fn pending_create(fields: Fields) -> Self {
        Self {
            id: generate_temp_id(),
            fields: strip_id(fields),
            sync: SyncState::PendingCreate,
            last_updated: Some(now_millis()),
        }
    }

    /// Builder: set the sync state.
    #[must_use]
    pub fn with_sync(mut self, sync: SyncState) -> Self {
        self.sync = sync;
        self
    }

    /// Returns true if the id is a local temp id.
    #[must_use]
    pub fn has_temp_id(&self) -> bool {
        is_temp_id(&self.id)
    }

    /// Get a field value.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Get a field as a string slice.
    #[must_use]
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Read a boolean field, treating absent or non-bool values as false.
    #[must_use]
    pub fn flag(&self, name: &str) -> bool {
        self.fields.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Set a single field.
    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if name != "id" {
            self.fields.insert(name, value);
        }
    }

    /// Shallow-merge a patch into the fields. `id` keys are ignored.
    pub fn merge_fields(&mut self, patch: &Fields) {
        for (key, value) in patch {
            if key != "id" {
                self.fields.insert(key.clone(), value.clone());
            }
        }
    }

    /// Fields sent to the backend. Ids and sync markers are never included.
    #[must_use]
    pub fn payload(&self) -> Fields {
        self.fields.clone()
    }
}

fn strip_id(mut fields: Fields) -> Fields {
    fields.remove("id");
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_temp_id_format() {
        let id = generate_temp_id();
        assert!(is_temp_id(&id));
        let parts: Vec<&str> = id.splitn(3, '-').collect();
        assert_eq!(parts[0], "temp");
        assert!(parts[1].parse::<u64>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert_ne!(id, generate_temp_id());
    }

    #[test]
    fn test_server_ids_are_not_temp() {
        assert!(!is_temp_id("64f0c2a9e1"));
        assert!(!is_temp_id("template-1"));
    }

    #[test]
    fn test_pending_create_record() {
        let record = Record::pending_create(fields(json!({"id": "x", "title": "Read"})));
        assert!(record.has_temp_id());
        assert_eq!(record.sync, SyncState::PendingCreate);
        assert!(record.field("id").is_none());
        assert!(record.last_updated.is_some());
    }

    #[test]
    fn test_update_transitions() {
        assert_eq!(
            SyncState::Clean.after_update(),
            Some(SyncState::PendingUpdate)
        );
        assert_eq!(
            SyncState::PendingCreate.after_update(),
            Some(SyncState::PendingCreate)
        );
        assert_eq!(
            SyncState::PendingActivation {
                fields_dirty: false
            }
            .after_update(),
            Some(SyncState::PendingActivation { fields_dirty: true })
        );
        assert_eq!(SyncState::PendingDelete.after_update(), None);
    }

    #[test]
    fn test_exclusive_toggle_transitions() {
        assert_eq!(
            SyncState::Clean.after_exclusive_toggle(true),
            Some(SyncState::PendingActivation {
                fields_dirty: false
            })
        );
        assert_eq!(
            SyncState::PendingUpdate.after_exclusive_toggle(false),
            Some(SyncState::PendingDeactivation { fields_dirty: true })
        );
        assert_eq!(
            SyncState::PendingActivation { fields_dirty: true }.after_exclusive_toggle(false),
            Some(SyncState::PendingDeactivation { fields_dirty: true })
        );
        assert_eq!(
            SyncState::PendingCreate.after_exclusive_toggle(true),
            Some(SyncState::PendingCreate)
        );
        assert_eq!(SyncState::PendingDelete.after_exclusive_toggle(true), None);
    }

    #[test]
    fn test_merge_ignores_id() {
        let mut record = Record::new("r1", fields(json!({"title": "Old"})));
        record.merge_fields(&fields(json!({"id": "r2", "title": "New", "done": true})));
        assert_eq!(record.id, "r1");
        assert_eq!(record.str_field("title"), Some("New"));
        assert!(record.flag("done"));
        assert!(record.field("id").is_none());
    }

    #[test]
    fn test_sync_state_serialization() {
        let record = Record::new("r1", Fields::new()).with_sync(SyncState::PendingActivation {
            fields_dirty: true,
        });
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["sync"]["state"], "pending_activation");
        assert_eq!(json["sync"]["fields_dirty"], true);
        assert!(json.get("last_updated").is_none());

        let restored: Record = serde_json::from_value(json).expect("deserialize");
        assert_eq!(restored, record);
    }

    #[test]
    fn test_missing_sync_defaults_to_clean() {
        let record: Record =
            serde_json::from_value(json!({"id": "a", "fields": {"x": 1}})).expect("deserialize");
        assert_eq!(record.sync, SyncState::Clean);
    }
}
