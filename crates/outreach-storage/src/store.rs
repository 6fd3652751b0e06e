//! Record store abstraction

use async_trait::async_trait;
use outreach_common::types::{Contact, FollowUpHistory};
use outreach_common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

const CONTACTS_FILE: &str = "contacts.json";
const HISTORY_FILE: &str = "follow_up_history.json";

/// Persistence for the records a send run reads and updates
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Load every contact, in stored order
    async fn load_contacts(&self) -> Result<Vec<Contact>>;

    /// Replace the stored contacts
    async fn save_contacts(&self, contacts: &[Contact]) -> Result<()>;

    /// Load the follow-up history
    async fn load_history(&self) -> Result<FollowUpHistory>;

    /// Replace the stored follow-up history
    async fn save_history(&self, history: &FollowUpHistory) -> Result<()>;
}

/// JSON files under a base directory
pub struct JsonFileStore {
    base_path: PathBuf,
}

impl JsonFileStore {
    /// Create a store rooted at `path`, creating the directory if needed
    pub fn new(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .map_err(|e| Error::Storage(format!("Failed to create storage directory: {}", e)))?;

        info!(path = %path.display(), "Initialized JSON record store");

        Ok(Self {
            base_path: path.to_path_buf(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    async fn read_json<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let path = self.base_path.join(name);

        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Storage(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let value = serde_json::from_slice(&data)
            .map_err(|e| Error::Storage(format!("Failed to parse {}: {}", path.display(), e)))?;

        debug!(file = %name, size = data.len(), "Read records");

        Ok(Some(value))
    }

    /// Write through a temporary file so a crash never leaves a truncated record file
    async fn write_json<T>(&self, name: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let path = self.base_path.join(name);
        let tmp_path = self.base_path.join(format!("{}.tmp", name));

        let data = serde_json::to_vec_pretty(value)
            .map_err(|e| Error::Storage(format!("Failed to encode {}: {}", name, e)))?;

        fs::write(&tmp_path, &data)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write {}: {}", tmp_path.display(), e)))?;

        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to replace {}: {}", path.display(), e)))?;

        debug!(file = %name, size = data.len(), "Wrote records");

        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn load_contacts(&self) -> Result<Vec<Contact>> {
        Ok(self.read_json(CONTACTS_FILE).await?.unwrap_or_default())
    }

    async fn save_contacts(&self, contacts: &[Contact]) -> Result<()> {
        self.write_json(CONTACTS_FILE, contacts).await
    }

    async fn load_history(&self) -> Result<FollowUpHistory> {
        Ok(self.read_json(HISTORY_FILE).await?.unwrap_or_default())
    }

    async fn save_history(&self, history: &FollowUpHistory) -> Result<()> {
        self.write_json(HISTORY_FILE, history).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use outreach_common::types::{ContactStatus, FollowUpRecord};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_files_load_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp_dir.path()).unwrap();

        assert!(store.load_contacts().await.unwrap().is_empty());
        assert!(store.load_history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_contacts_persist() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(&temp_dir.path().join("nested")).unwrap();

        let mut sent = Contact::new("sent@example.com");
        sent.status = ContactStatus::Sent;
        sent.sent_count = 2;
        sent.last_sent_at = Some(Utc::now());
        let contacts = vec![Contact::new("pending@example.com"), sent];

        store.save_contacts(&contacts).await.unwrap();
        let loaded = store.load_contacts().await.unwrap();

        assert_eq!(loaded, contacts);
        assert!(!temp_dir.path().join("nested/contacts.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_history_persist() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp_dir.path()).unwrap();

        let mut history = FollowUpHistory::new();
        history.record(
            "a@example.com",
            FollowUpRecord {
                rule_name: "nudge".to_string(),
                timestamp: Utc::now(),
                success: false,
                error: Some("Transport error: refused".to_string()),
            },
        );

        store.save_history(&history).await.unwrap();
        let loaded = store.load_history().await.unwrap();

        assert_eq!(loaded.count("a@example.com", "nudge"), 1);
        assert_eq!(loaded, history);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_storage_error() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(CONTACTS_FILE), b"{not json").unwrap();
        let store = JsonFileStore::new(temp_dir.path()).unwrap();

        let err = store.load_contacts().await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }
}
