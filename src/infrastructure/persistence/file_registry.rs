//! Registry persisted as a JSON file

use crate::domain::presence::Registry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{info, warn};

/// Key/value registry written through to a JSON file on every change
pub struct FileRegistry {
    path: PathBuf,
    values: RwLock<BTreeMap<String, String>>,
}

impl FileRegistry {
    /// Open the registry, starting empty when the file is missing or corrupt
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
                warn!("Ignoring unreadable registry {}: {}", path.display(), e);
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        info!("Registry {} opened with {} entries", path.display(), values.len());

        Self {
            path,
            values: RwLock::new(values),
        }
    }

    fn persist(&self, values: &BTreeMap<String, String>) {
        let result = serde_json::to_vec_pretty(values)
            .map_err(|e| e.to_string())
            .and_then(|data| std::fs::write(&self.path, data).map_err(|e| e.to_string()));
        if let Err(e) = result {
            warn!("Failed to write registry {}: {}", self.path.display(), e);
        }
    }
}

impl Registry for FileRegistry {
    fn read_string(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }

    fn write_string(&self, key: &str, value: &str) {
        let mut values = self.values.write().unwrap_or_else(|p| p.into_inner());
        values.insert(key.to_string(), value.to_string());
        self.persist(&values);
    }

    fn remove_parameter(&self, key: &str) {
        let mut values = self.values.write().unwrap_or_else(|p| p.into_inner());
        if values.remove(key).is_some() {
            self.persist(&values);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_survive_reopen() {
        let path = std::env::temp_dir().join(format!("rcs-registry-{}.json", uuid::Uuid::new_v4()));

        let registry = FileRegistry::open(&path);
        registry.write_string("sip_entity_tag", "etag-1");
        registry.write_long("sip_etag_expiration", 1_700_000_000_000);
        drop(registry);

        let reopened = FileRegistry::open(&path);
        assert_eq!(reopened.read_string("sip_entity_tag"), Some("etag-1".to_string()));
        assert_eq!(reopened.read_long("sip_etag_expiration"), Some(1_700_000_000_000));

        reopened.remove_parameter("sip_entity_tag");
        assert!(FileRegistry::open(&path).read_string("sip_entity_tag").is_none());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let path = std::env::temp_dir().join(format!("rcs-registry-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, b"{not json").unwrap();
        let registry = FileRegistry::open(&path);
        assert!(registry.read_string("anything").is_none());
        let _ = std::fs::remove_file(&path);
    }
}
