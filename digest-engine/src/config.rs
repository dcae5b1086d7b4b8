use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use interfaces::{CollaboratorError, ConfigStore, Task};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    tasks: Vec<Task>,
}

/// File-backed configuration store. Saves go through a temp file and an
/// atomic rename so a crash mid-write never truncates the config.
pub struct JsonConfigStore {
    path: PathBuf,
    cached: RwLock<ConfigFile>,
}

impl JsonConfigStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CollaboratorError> {
        let path = path.into();
        let cached = if path.exists() {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| CollaboratorError::Transient(format!("read config: {}", e)))?;
            serde_json::from_str(&raw)
                .map_err(|e| CollaboratorError::Rejection(format!("malformed config file: {}", e)))?
        } else {
            ConfigFile::default()
        };
        Ok(Self {
            path,
            cached: RwLock::new(cached),
        })
    }

    async fn persist(&self, config: &ConfigFile) -> Result<(), CollaboratorError> {
        let raw = serde_json::to_string_pretty(config)
            .map_err(|e| CollaboratorError::Rejection(format!("serialize config: {}", e)))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw)
            .await
            .map_err(|e| CollaboratorError::Transient(format!("write config: {}", e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| CollaboratorError::Transient(format!("replace config: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for JsonConfigStore {
    async fn tasks(&self) -> Result<Vec<Task>, CollaboratorError> {
        Ok(self.cached.read().await.tasks.clone())
    }

    async fn deactivate_recipient(
        &self,
        task_id: Option<Uuid>,
        address: &str,
    ) -> Result<bool, CollaboratorError> {
        let mut config = self.cached.write().await;
        let mut changed = false;

        for task in config.tasks.iter_mut() {
            if task_id.is_some_and(|id| id != task.id) {
                continue;
            }
            for recipient in task.recipients.iter_mut() {
                if recipient.active && recipient.address.eq_ignore_ascii_case(address) {
                    recipient.active = false;
                    recipient.unsubscribed_at = Some(Utc::now());
                    changed = true;
                    info!("deactivated recipient {} in task '{}'", address, task.name);
                }
            }
        }

        if changed {
            self.persist(&config).await?;
        }
        Ok(changed)
    }
}

/// In-memory configuration store for tests and embedded use.
pub struct StaticConfig {
    tasks: RwLock<Vec<Task>>,
}

impl StaticConfig {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: RwLock::new(tasks),
        }
    }
}

#[async_trait]
impl ConfigStore for StaticConfig {
    async fn tasks(&self) -> Result<Vec<Task>, CollaboratorError> {
        Ok(self.tasks.read().await.clone())
    }

    async fn deactivate_recipient(
        &self,
        task_id: Option<Uuid>,
        address: &str,
    ) -> Result<bool, CollaboratorError> {
        let mut tasks = self.tasks.write().await;
        let mut changed = false;
        for task in tasks.iter_mut() {
            if task_id.is_some_and(|id| id != task.id) {
                continue;
            }
            for recipient in task.recipients.iter_mut() {
                if recipient.active && recipient.address.eq_ignore_ascii_case(address) {
                    recipient.active = false;
                    recipient.unsubscribed_at = Some(Utc::now());
                    changed = true;
                }
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interfaces::{CadenceSpec, Recipient};

    fn task_with_recipient(address: &str) -> Task {
        Task {
            id: Uuid::new_v4(),
            name: "daily".to_string(),
            enabled: true,
            feeds: Vec::new(),
            recipients: vec![Recipient::new(address)],
            tag_rules: Default::default(),
            ai: Default::default(),
            cadence: CadenceSpec::Interval { minutes: 60 },
            delivery: Default::default(),
        }
    }

    #[tokio::test]
    async fn deactivation_is_case_insensitive_and_idempotent() {
        let store = StaticConfig::new(vec![task_with_recipient("User@Example.com")]);

        assert!(store.deactivate_recipient(None, "user@example.com").await.unwrap());
        let tasks = store.tasks().await.unwrap();
        assert!(!tasks[0].recipients[0].active);
        assert!(tasks[0].recipients[0].unsubscribed_at.is_some());

        // Already inactive: no change reported.
        assert!(!store.deactivate_recipient(None, "user@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn task_scoped_deactivation_leaves_other_tasks_alone() {
        let a = task_with_recipient("shared@example.com");
        let b = task_with_recipient("shared@example.com");
        let a_id = a.id;
        let store = StaticConfig::new(vec![a, b]);

        assert!(store
            .deactivate_recipient(Some(a_id), "shared@example.com")
            .await
            .unwrap());
        let tasks = store.tasks().await.unwrap();
        assert!(!tasks[0].recipients[0].active);
        assert!(tasks[1].recipients[0].active);
    }

    #[tokio::test]
    async fn json_store_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("newsbrief-test-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("config.json");

        let task = task_with_recipient("a@example.com");
        let raw = serde_json::json!({ "tasks": [task] });
        tokio::fs::write(&path, serde_json::to_string(&raw).unwrap())
            .await
            .unwrap();

        let store = JsonConfigStore::open(&path).await.unwrap();
        assert_eq!(store.tasks().await.unwrap().len(), 1);

        assert!(store.deactivate_recipient(None, "a@example.com").await.unwrap());

        // The change survived the save.
        let reopened = JsonConfigStore::open(&path).await.unwrap();
        assert!(!reopened.tasks().await.unwrap()[0].recipients[0].active);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
