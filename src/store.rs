//! Write-through persistence for channel records.
//!
//! The store is a thin key-to-row writer: it never gates a request, its
//! failures are logged and swallowed, and the in-memory `ChannelTable`
//! stays authoritative regardless of what the store does.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs;

use telehub_service::ChannelSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: String,
    pub devid: String,
    pub vin: Option<String>,
    pub flags: u32,
}

impl From<&ChannelSnapshot> for ChannelRecord {
    fn from(s: &ChannelSnapshot) -> Self {
        Self {
            id: s.id.clone(),
            devid: s.devid.clone(),
            vin: s.vin.clone(),
            flags: s.flags,
        }
    }
}

#[async_trait::async_trait]
pub trait StoreAdapter: Send + Sync {
    async fn save_channel(&self, record: ChannelRecord);
    async fn load_channels(&self) -> Vec<ChannelRecord>;
}

/// No-op store, used in tests and when persistence is disabled.
#[derive(Default)]
pub struct NullStore;

#[async_trait::async_trait]
impl StoreAdapter for NullStore {
    async fn save_channel(&self, _record: ChannelRecord) {}

    async fn load_channels(&self) -> Vec<ChannelRecord> {
        Vec::new()
    }
}

/// A JSON-per-channel file store under `data_dir`, upserting by channel
/// id and reloading the whole directory at startup.
pub struct FileStore {
    data_dir: PathBuf,
}

impl FileStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.data_dir.join(format!("{id}.json"))
    }
}

#[async_trait::async_trait]
impl StoreAdapter for FileStore {
    async fn save_channel(&self, record: ChannelRecord) {
        if let Err(e) = fs::create_dir_all(&self.data_dir).await {
            log::warn!("store: failed to create data dir {:?}: {e}", self.data_dir);
            return;
        }

        let path = self.path_for(&record.id);
        match serde_json::to_vec_pretty(&record) {
            Ok(bytes) => {
                if let Err(e) = fs::write(&path, bytes).await {
                    log::warn!("store: failed to write {:?}: {e}", path);
                }
            }
            Err(e) => log::warn!("store: failed to serialize channel {}: {e}", record.id),
        }
    }

    async fn load_channels(&self) -> Vec<ChannelRecord> {
        let mut records = Vec::new();

        let mut entries = match fs::read_dir(&self.data_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("store: failed to read data dir {:?}: {e}", self.data_dir);
                return records;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<ChannelRecord>(&bytes) {
                    Ok(record) => records.push(record),
                    Err(e) => log::warn!("store: failed to parse {:?}: {e}", path),
                },
                Err(e) => log::warn!("store: failed to read {:?}: {e}", path),
            }
        }

        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_roundtrips() {
        let dir = std::env::temp_dir().join(format!("telehub-store-test-{}", std::process::id()));
        let store = FileStore::new(&dir);

        store
            .save_channel(ChannelRecord {
                id: "ABCD".into(),
                devid: "DEV1234".into(),
                vin: Some("11111111111111111".into()),
                flags: 1,
            })
            .await;

        let loaded = store.load_channels().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].devid, "DEV1234");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn null_store_is_inert() {
        let store = NullStore;
        store
            .save_channel(ChannelRecord {
                id: "X".into(),
                devid: "DEV1234".into(),
                vin: None,
                flags: 0,
            })
            .await;
        assert!(store.load_channels().await.is_empty());
    }
}
