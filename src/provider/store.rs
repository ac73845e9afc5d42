// Credential persistence: JSON files keyed by auth id under a base
// directory.

use super::auth::Auth;
use crate::error::GatewayError;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

pub trait TokenStore: Send + Sync {
    fn load(&self, id: &str) -> Result<Option<Auth>, GatewayError>;
    fn save(&self, auth: &Auth) -> Result<(), GatewayError>;
    fn delete(&self, id: &str) -> Result<(), GatewayError>;
    fn list(&self) -> Result<Vec<Auth>, GatewayError>;
    fn set_base_dir(&self, dir: &Path);
}

pub struct FileTokenStore {
    base: RwLock<PathBuf>,
}

impl FileTokenStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: RwLock::new(base.into()),
        }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        let safe: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.base.read().unwrap().join(format!("{safe}.json"))
    }

    fn ensure_dir(&self) -> Result<(), GatewayError> {
        std::fs::create_dir_all(&*self.base.read().unwrap())?;
        Ok(())
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self, id: &str) -> Result<Option<Auth>, GatewayError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn save(&self, auth: &Auth) -> Result<(), GatewayError> {
        self.ensure_dir()?;
        let path = self.path_for(&auth.id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(auth)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), GatewayError> {
        let path = self.path_for(id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<Auth>, GatewayError> {
        let base = self.base.read().unwrap().clone();
        if !base.exists() {
            return Ok(Vec::new());
        }
        let mut auths = Vec::new();
        for entry in std::fs::read_dir(base)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(GatewayError::from)
                .and_then(|c| serde_json::from_str(&c).map_err(GatewayError::from))
            {
                Ok(auth) => auths.push(auth),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable credential file");
                }
            }
        }
        auths.sort_by(|a: &Auth, b: &Auth| a.id.cmp(&b.id));
        Ok(auths)
    }

    fn set_base_dir(&self, dir: &Path) {
        *self.base.write().unwrap() = dir.to_path_buf();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path());

        let mut auth = Auth::new("auth-1", "gemini");
        auth.attributes
            .insert("api_key".to_string(), "k".to_string());
        store.save(&auth).unwrap();

        let loaded = store.load("auth-1").unwrap().unwrap();
        assert_eq!(loaded.provider, "gemini");
        assert_eq!(loaded.attribute("api_key"), Some("k"));
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path());
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn test_list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path());
        store.save(&Auth::new("b", "openai")).unwrap();
        store.save(&Auth::new("a", "gemini")).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "a");

        store.delete("a").unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
        // Deleting again is a no-op.
        store.delete("a").unwrap();
    }

    #[test]
    fn test_ids_are_sanitised() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path());
        let auth = Auth::new("weird/../id", "openai");
        store.save(&auth).unwrap();
        // The file lands inside the base dir despite the hostile id.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
