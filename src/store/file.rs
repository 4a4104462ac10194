use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;

use super::{KvStore, Record, StoreError};

const TEMP_PREFIX: &str = ".tmp-";
const EXTENSION: &str = ".json";

/// One JSON file per key under `root/<namespace>/`.
///
/// Writes go to a temp file first and are moved into place, so a reader in
/// another request never sees a half-written record. Shared across worker
/// processes as long as they share the directory.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        tracing::info!(root = %root.display(), "File store ready");
        Ok(Self { root })
    }

    async fn namespace_dir(&self, namespace: &str) -> Result<PathBuf, StoreError> {
        let dir = self.root.join(encode_key(namespace));
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn write_temp(&self, dir: &Path, value: &str) -> Result<PathBuf, StoreError> {
        let temp = dir.join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4().simple()));
        fs::write(&temp, value).await?;
        Ok(temp)
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Record>, StoreError> {
        let path = self.namespace_dir(namespace).await?.join(file_name(key));
        let value = match fs::read_to_string(&path).await {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let updated_at = fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(Some(Record { value, updated_at }))
    }

    async fn put(&self, namespace: &str, key: &str, value: String) -> Result<(), StoreError> {
        let dir = self.namespace_dir(namespace).await?;
        let temp = self.write_temp(&dir, &value).await?;
        if let Err(e) = fs::rename(&temp, dir.join(file_name(key))).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn put_if_absent(
        &self,
        namespace: &str,
        key: &str,
        value: String,
    ) -> Result<bool, StoreError> {
        let dir = self.namespace_dir(namespace).await?;
        let temp = self.write_temp(&dir, &value).await?;
        // hard_link fails if the target exists, which makes this create-once.
        let linked = fs::hard_link(&temp, dir.join(file_name(key))).await;
        let _ = fs::remove_file(&temp).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        let path = self.namespace_dir(namespace).await?.join(file_name(key));
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.namespace_dir(namespace).await?;
        let mut entries = fs::read_dir(&dir).await?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            if let Some(stem) = name.strip_suffix(EXTENSION) {
                if let Some(key) = decode_key(stem) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn purge_older_than(
        &self,
        namespace: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let dir = self.namespace_dir(namespace).await?;
        let mut entries = fs::read_dir(&dir).await?;
        let mut purged = 0;
        while let Some(entry) = entries.next_entry().await? {
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(m) => DateTime::<Utc>::from(m),
                Err(_) => continue,
            };
            if modified < cutoff {
                match fs::remove_file(entry.path()).await {
                    Ok(()) => purged += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(purged)
    }
}

fn file_name(key: &str) -> String {
    format!("{}{EXTENSION}", encode_key(key))
}

/// Escape a key into a safe file name. `[A-Za-z0-9_-]` pass through, every
/// other byte becomes `=XX`. Reversible, so `keys()` returns the original keys.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' => out.push(b as char),
            _ => out.push_str(&format!("={b:02X}")),
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'=' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
