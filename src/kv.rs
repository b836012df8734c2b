//! The global key/value store (§4.6): a durable `key -> value` mapping,
//! exclusively owned by this module. Keys and values are opaque JSON terms;
//! `set`/`delete` only return once the mutation is fsynced, so a
//! crash-and-restart observes it.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use sled::Db;

#[derive(Clone)]
pub struct GlobalKv {
    db: Db,
}

fn encode_key(key: &Value) -> Vec<u8> {
    // Keys are compared for exact equality only; ordering is irrelevant, so
    // a stable JSON encoding is sufficient as a sled key.
    serde_json::to_vec(key).unwrap_or_default()
}

impl GlobalKv {
    /// Opens (creating if absent) the durable store at `path`, creating its
    /// parent directory on first start.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }
        let db = sled::open(path).with_context(|| format!("opening global KV store at {}", path.display()))?;
        Ok(GlobalKv { db })
    }

    pub async fn get(&self, key: &Value, default: Value) -> Value {
        let db = self.db.clone();
        let key = encode_key(key);
        let result = tokio::task::spawn_blocking(move || db.get(key)).await;
        match result {
            Ok(Ok(Some(bytes))) => serde_json::from_slice(&bytes).unwrap_or(default),
            _ => default,
        }
    }

    /// Returns only after the write has been fsynced: a fresh process
    /// restarting right after this call observes `value`.
    pub async fn set(&self, key: &Value, value: &Value) -> Result<()> {
        let db = self.db.clone();
        let key = encode_key(key);
        let bytes = serde_json::to_vec(value).context("serializing global KV value")?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            db.insert(key, bytes)?;
            db.flush()?;
            Ok(())
        })
        .await
        .context("global KV write task panicked")??;
        Ok(())
    }

    pub async fn delete(&self, key: &Value) -> Result<()> {
        let db = self.db.clone();
        let key = encode_key(key);
        tokio::task::spawn_blocking(move || -> Result<()> {
            db.remove(key)?;
            db.flush()?;
            Ok(())
        })
        .await
        .context("global KV delete task panicked")??;
        Ok(())
    }

    pub fn all(&self) -> Vec<(Value, Value)> {
        self.db
            .iter()
            .filter_map(|entry| entry.ok())
            .filter_map(|(k, v)| {
                let key: Value = serde_json::from_slice(&k).ok()?;
                let value: Value = serde_json::from_slice(&v).ok()?;
                Some((key, value))
            })
            .collect()
    }

    pub fn keys(&self) -> Vec<Value> {
        self.all().into_iter().map(|(key, _)| key).collect()
    }

    pub async fn clear(&self) -> Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            db.clear()?;
            db.flush()?;
            Ok(())
        })
        .await
        .context("global KV clear task panicked")??;
        Ok(())
    }

    /// Flushes and drops the underlying database handle. Called on
    /// graceful shutdown.
    pub fn close(&self) {
        let _ = self.db.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile_shim::TempDir;

    mod tempfile_shim {
        use std::path::{Path, PathBuf};

        /// Minimal scratch-directory helper so tests don't need an extra
        /// `tempfile` dev-dependency just for this module.
        pub struct TempDir(PathBuf);

        impl TempDir {
            pub fn new(label: &str) -> Self {
                let mut path = std::env::temp_dir();
                path.push(format!(
                    "mirai-kv-test-{label}-{}",
                    std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap()
                        .as_nanos()
                ));
                TempDir(path)
            }

            pub fn path(&self) -> &Path {
                &self.0
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    #[tokio::test]
    async fn set_then_get_returns_value() {
        let dir = TempDir::new("roundtrip");
        let kv = GlobalKv::open(&dir.path().join("global_state.dat")).unwrap();
        let key = json!("night_mode");
        kv.set(&key, &json!(true)).await.unwrap();
        assert_eq!(kv.get(&key, json!(false)).await, json!(true));
    }

    #[tokio::test]
    async fn get_missing_key_returns_default() {
        let dir = TempDir::new("missing");
        let kv = GlobalKv::open(&dir.path().join("global_state.dat")).unwrap();
        assert_eq!(kv.get(&json!("missing"), json!("fallback")).await, json!("fallback"));
    }

    #[tokio::test]
    async fn set_delete_then_get_returns_default() {
        let dir = TempDir::new("delete");
        let kv = GlobalKv::open(&dir.path().join("global_state.dat")).unwrap();
        let key = json!("k");
        kv.set(&key, &json!(1)).await.unwrap();
        kv.delete(&key).await.unwrap();
        assert_eq!(kv.get(&key, json!(null)).await, json!(null));
    }

    #[tokio::test]
    async fn survives_reopening_the_same_path() {
        let dir = TempDir::new("persistence");
        let path = dir.path().join("global_state.dat");
        {
            let kv = GlobalKv::open(&path).unwrap();
            kv.set(&json!("night_mode"), &json!(true)).await.unwrap();
            kv.close();
        }
        let kv = GlobalKv::open(&path).unwrap();
        assert_eq!(kv.get(&json!("night_mode"), json!(false)).await, json!(true));
    }
}
