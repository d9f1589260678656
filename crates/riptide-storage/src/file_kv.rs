// Durable file-backed key-value store.
//
// One file per key under a single root directory. Key bytes are hex-encoded
// into the file name, so arbitrary key strings (including `/`) are safe on
// any filesystem, and `scan` is a directory walk plus a name decode. Writes
// land in a temp file first and are renamed into place, so a crash leaves
// either the old value or the new one, never a torn file.
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::{KvStore, Result, StorageError};

const TMP_SUFFIX: &str = ".tmp";

pub struct FileKv {
    root: PathBuf,
}

impl FileKv {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(encode_key(key))
    }
}

#[async_trait]
impl KvStore for FileKv {
    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        let path = self.path_for(key);
        let tmp = self.root.join(format!("{}{}", encode_key(key), TMP_SUFFIX));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&value).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Bytes)>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(TMP_SUFFIX) {
                continue;
            }
            let key = decode_key(name, entry.path().as_path())?;
            if !key.starts_with(prefix) {
                continue;
            }
            let bytes = tokio::fs::read(entry.path()).await?;
            entries.push((key, Bytes::from(bytes)));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len() * 2);
    for byte in key.as_bytes() {
        encoded.push_str(&format!("{byte:02x}"));
    }
    encoded
}

fn decode_key(name: &str, path: &Path) -> Result<String> {
    if name.len() % 2 != 0 {
        return Err(StorageError::Corruption(path.display().to_string()));
    }
    let mut bytes = Vec::with_capacity(name.len() / 2);
    for chunk in name.as_bytes().chunks(2) {
        let hex = std::str::from_utf8(chunk)
            .map_err(|_| StorageError::Corruption(path.display().to_string()))?;
        let byte = u8::from_str_radix(hex, 16)
            .map_err(|_| StorageError::Corruption(path.display().to_string()))?;
        bytes.push(byte);
    }
    String::from_utf8(bytes).map_err(|_| StorageError::Corruption(path.display().to_string()))
}
