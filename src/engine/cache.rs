//! Node result cache.
//!
//! Results live on disk next to the artifacts they describe: every node
//! directory holds a `result.json` and a `_0x<hash>.json` snapshot of the
//! inputs that produced it. A moka cache keeps recently used records in
//! memory so repeated lookups during one run avoid re-reading the file.

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};

/// Name of the result record inside a node directory.
pub const RESULT_FILE: &str = "result.json";

/// Default number of records kept in memory.
const DEFAULT_CACHE_CAPACITY: u64 = 10_000;

/// What a finished node run left behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResultRecord {
    pub node_id: String,
    pub interface: String,
    pub hash: String,
    pub inputs: BTreeMap<String, Value>,
    pub outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub runtime: Value,
    pub finished_at: DateTime<Utc>,
}

/// Summary of the results stored under a base directory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub result_count: u64,
    pub total_bytes: u64,
    pub memory_entries: u64,
}

/// On-disk node results with an in-memory front.
#[derive(Clone)]
pub struct ResultCache {
    memory: Cache<PathBuf, Arc<NodeResultRecord>>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(max_capacity: u64) -> Self {
        Self {
            memory: Cache::builder().max_capacity(max_capacity).build(),
        }
    }

    /// Find a reusable result for `hash` in `node_dir`.
    ///
    /// A record only counts when its hash matches and every output file it
    /// names inside the node directory is still there.
    pub async fn lookup(&self, node_dir: &Path, hash: &str) -> Option<Arc<NodeResultRecord>> {
        let record = match self.memory.get(&node_dir.to_path_buf()).await {
            Some(record) => record,
            None => {
                let record = Arc::new(read_record(node_dir).await?);
                self.memory
                    .insert(node_dir.to_path_buf(), record.clone())
                    .await;
                record
            }
        };

        if record.hash != hash {
            debug!(dir = %node_dir.display(), "stale result, hash changed");
            return None;
        }

        let mut files = Vec::new();
        for value in record.outputs.values() {
            collect_paths(value, node_dir, &mut files);
        }
        for file in files {
            if !tokio::fs::try_exists(&file).await.unwrap_or(false) {
                debug!(dir = %node_dir.display(), file = %file.display(), "cached output missing");
                return None;
            }
        }

        Some(record)
    }

    /// Give a node run an empty working directory.
    pub async fn prepare(&self, node_dir: &Path) -> Result<()> {
        self.memory.invalidate(&node_dir.to_path_buf()).await;
        if tokio::fs::try_exists(node_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(node_dir).await?;
        }
        tokio::fs::create_dir_all(node_dir).await?;
        Ok(())
    }

    /// Persist a finished run.
    pub async fn store(
        &self,
        node_dir: &Path,
        record: NodeResultRecord,
        hashed_inputs: &Value,
    ) -> Result<Arc<NodeResultRecord>> {
        tokio::fs::create_dir_all(node_dir).await?;
        let snapshot = node_dir.join(format!("_0x{}.json", record.hash));
        tokio::fs::write(&snapshot, serde_json::to_string_pretty(hashed_inputs)?).await?;
        tokio::fs::write(
            node_dir.join(RESULT_FILE),
            serde_json::to_string_pretty(&record)?,
        )
        .await?;

        let record = Arc::new(record);
        self.memory
            .insert(node_dir.to_path_buf(), record.clone())
            .await;
        Ok(record)
    }

    pub async fn invalidate(&self, node_dir: &Path) {
        self.memory.invalidate(&node_dir.to_path_buf()).await;
    }

    /// Count stored results and their directories' size.
    pub async fn stats(&self, base_dir: &Path) -> Result<CacheStats> {
        self.memory.run_pending_tasks().await;
        let memory_entries = self.memory.entry_count();

        let base = base_dir.to_path_buf();
        let (result_count, total_bytes) = tokio::task::spawn_blocking(move || {
            let mut results = 0u64;
            let mut bytes = 0u64;
            for entry in walkdir::WalkDir::new(&base)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                if entry.file_name() == RESULT_FILE {
                    results += 1;
                }
                bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
            (results, bytes)
        })
        .await
        .map_err(|e| Error::Internal(format!("Cache scan failed: {}", e)))?;

        Ok(CacheStats {
            result_count,
            total_bytes,
            memory_entries,
        })
    }

    /// Remove everything under `base_dir`. Returns how many results were dropped.
    pub async fn clear(&self, base_dir: &Path) -> Result<u64> {
        let stats = self.stats(base_dir).await?;
        if tokio::fs::try_exists(base_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(base_dir).await?;
        }
        self.memory.invalidate_all();
        Ok(stats.result_count)
    }
}

async fn read_record(node_dir: &Path) -> Option<NodeResultRecord> {
    let text = tokio::fs::read_to_string(node_dir.join(RESULT_FILE))
        .await
        .ok()?;
    match serde_json::from_str(&text) {
        Ok(record) => Some(record),
        Err(e) => {
            debug!(dir = %node_dir.display(), error = %e, "unreadable result record");
            None
        }
    }
}

/// Absolute paths under `root` mentioned by an output value.
fn collect_paths(value: &Value, root: &Path, out: &mut Vec<PathBuf>) {
    match value {
        Value::String(s) => {
            let path = Path::new(s);
            if path.is_absolute() && path.starts_with(root) {
                out.push(path.to_path_buf());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_paths(item, root, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(dir: &Path, hash: &str) -> NodeResultRecord {
        let mut outputs = BTreeMap::new();
        outputs.insert(
            "out_file".to_string(),
            json!(dir.join("smoothed.nii").to_string_lossy()),
        );
        outputs.insert("fwhm".to_string(), json!(8));
        NodeResultRecord {
            node_id: "smooth".to_string(),
            interface: "spm_smooth".to_string(),
            hash: hash.to_string(),
            inputs: BTreeMap::new(),
            outputs,
            runtime: Value::Null,
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_store_then_lookup() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("smooth");
        let cache = ResultCache::new();

        cache.prepare(&dir).await.unwrap();
        std::fs::write(dir.join("smoothed.nii"), b"data").unwrap();
        cache
            .store(&dir, record(&dir, "abc"), &json!({"inputs": {}}))
            .await
            .unwrap();

        assert!(dir.join(RESULT_FILE).exists());
        assert!(dir.join("_0xabc.json").exists());
        assert!(cache.lookup(&dir, "abc").await.is_some());
        assert!(cache.lookup(&dir, "def").await.is_none());

        // a fresh cache reads the record back from disk
        let cold = ResultCache::new();
        let hit = cold.lookup(&dir, "abc").await.unwrap();
        assert_eq!(hit.outputs["fwhm"], json!(8));
    }

    #[tokio::test]
    async fn test_missing_output_file_is_a_miss() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("smooth");
        let cache = ResultCache::new();

        cache.prepare(&dir).await.unwrap();
        std::fs::write(dir.join("smoothed.nii"), b"data").unwrap();
        cache
            .store(&dir, record(&dir, "abc"), &Value::Null)
            .await
            .unwrap();

        std::fs::remove_file(dir.join("smoothed.nii")).unwrap();
        assert!(cache.lookup(&dir, "abc").await.is_none());
    }

    #[tokio::test]
    async fn test_prepare_clears_old_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("realign");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("old.txt"), b"x").unwrap();

        let cache = ResultCache::new();
        cache.prepare(&dir).await.unwrap();
        assert!(dir.exists());
        assert!(!dir.join("old.txt").exists());
    }

    #[tokio::test]
    async fn test_stats_and_clear() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("work");
        let cache = ResultCache::new();

        for name in ["a", "b"] {
            let dir = base.join("wf").join(name);
            cache.prepare(&dir).await.unwrap();
            std::fs::write(dir.join("smoothed.nii"), b"data").unwrap();
            cache
                .store(&dir, record(&dir, "h"), &Value::Null)
                .await
                .unwrap();
        }

        let stats = cache.stats(&base).await.unwrap();
        assert_eq!(stats.result_count, 2);
        assert!(stats.total_bytes > 0);

        assert_eq!(cache.clear(&base).await.unwrap(), 2);
        assert!(!base.exists());
        assert_eq!(cache.stats(&base).await.unwrap().result_count, 0);
    }
}
