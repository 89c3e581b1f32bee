use std::fmt;

use specta::Type;

/// Identifies one tracked unit of background work (install, repair, process run).
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize, Type,
)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Stable identity of one managed installation.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize, Type,
)]
pub struct InstallationId(pub String);

impl InstallationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstallationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstallationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstallationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Catalog key of a supported application kind (e.g. `comfyui`).
///
/// NOTE: The set of valid kinds is owned by the agent's catalog, not by this type.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize, Type,
)]
pub struct UiKind(pub String);

impl UiKind {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UiKind {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Error | TaskState::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct TaskStatus {
    pub task_id: TaskId,
    /// Human label such as "install" or "process".
    pub kind: String,
    /// What the task acts on (installation id, display name, ...).
    pub identifier: String,
    pub status: TaskState,
    /// 0..=100, non-decreasing while the task is live.
    pub progress: f64,
    pub status_text: Option<String>,
    pub processed_units: Option<u64>,
    pub total_units: Option<u64>,
    pub error_message: Option<String>,
    pub result_path: Option<String>,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
}

/// Payload handed to the notification sink.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Notification {
    Update { data: TaskStatus },
    Remove { task_id: TaskId },
}

impl Notification {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Notification::Update { data } => &data.task_id,
            Notification::Remove { task_id } => task_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct InstallationRecord {
    pub installation_id: InstallationId,
    pub ui_kind: UiKind,
    pub display_name: String,
    /// Absolute install location.
    pub path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_non_empty() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert!(!a.0.is_empty());
        assert_ne!(a, b);
        assert!(!InstallationId::new().0.is_empty());
    }

    #[test]
    fn terminal_states() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Error.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
    }

    #[test]
    fn remove_notification_uses_type_tag() {
        let n = Notification::Remove {
            task_id: TaskId::from("t1"),
        };
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["type"], "remove");
        assert_eq!(v["task_id"], "t1");
    }

    #[test]
    fn update_notification_wraps_status_in_data() {
        let status = TaskStatus {
            task_id: TaskId::from("t2"),
            kind: "install".to_string(),
            identifier: "comfyui".to_string(),
            status: TaskState::Pending,
            progress: 0.0,
            status_text: None,
            processed_units: None,
            total_units: None,
            error_message: None,
            result_path: None,
            created_at_unix_ms: 1,
            updated_at_unix_ms: 1,
        };
        let v = serde_json::to_value(Notification::Update { data: status }).unwrap();
        assert_eq!(v["type"], "update");
        assert_eq!(v["data"]["status"], "pending");
        assert_eq!(v["data"]["task_id"], "t2");
    }
}
