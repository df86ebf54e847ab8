use crate::doc_cache::lock;
use crate::error::Result;
use crate::model::normalize_entity;
use indexmap::IndexSet;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::PoisonError;
use tracing::info;
use tracing::warn;

/// Access counter with one-way promotion of frequently requested entities.
///
/// The promoted set is persisted as a JSON list of names so promotion
/// survives restarts.
pub struct PopularityTracker {
    threshold: u64,
    store_path: Option<PathBuf>,
    counts: Mutex<HashMap<String, u64>>,
    promoted: Mutex<IndexSet<String>>,
    persist_lock: Mutex<()>,
}

impl PopularityTracker {
    pub fn in_memory(threshold: u64) -> Self {
        Self {
            threshold: threshold.max(1),
            store_path: None,
            counts: Mutex::new(HashMap::new()),
            promoted: Mutex::new(IndexSet::new()),
            persist_lock: Mutex::new(()),
        }
    }

    /// Loads the persisted promoted list. A missing file starts empty; an
    /// unreadable one is logged and ignored.
    pub fn load(threshold: u64, store_path: Option<PathBuf>) -> Self {
        let mut tracker = Self::in_memory(threshold);
        if let Some(path) = &store_path {
            match read_promoted(path) {
                Ok(names) => {
                    if !names.is_empty() {
                        info!(
                            count = names.len(),
                            path = %path.display(),
                            "loaded popular entities"
                        );
                    }
                    let promoted = tracker
                        .promoted
                        .get_mut()
                        .unwrap_or_else(PoisonError::into_inner);
                    promoted.extend(names.iter().map(|name| normalize_entity(name)));
                }
                Err(err) => {
                    warn!(path = %path.display(), "ignoring unreadable popularity store: {err}");
                }
            }
        }
        tracker.store_path = store_path;
        tracker
    }

    /// Counts one access. Returns true when this access promoted the entity.
    pub fn record_access(&self, entity: &str) -> bool {
        let entity = normalize_entity(entity);
        let count = {
            let mut counts = lock(&self.counts);
            let count = counts.entry(entity.clone()).or_default();
            *count += 1;
            *count
        };
        if count < self.threshold {
            return false;
        }
        let newly_promoted = lock(&self.promoted).insert(entity.clone());
        if newly_promoted {
            info!(entity = %entity, accesses = count, "entity promoted to popular");
            if let Err(err) = self.persist() {
                warn!("failed to persist popular entities: {err}");
            }
        }
        newly_promoted
    }

    pub fn is_popular(&self, entity: &str) -> bool {
        lock(&self.promoted).contains(&normalize_entity(entity))
    }

    /// Promoted entities in promotion order.
    pub fn promoted(&self) -> Vec<String> {
        lock(&self.promoted).iter().cloned().collect()
    }

    pub fn access_count(&self, entity: &str) -> u64 {
        lock(&self.counts)
            .get(&normalize_entity(entity))
            .copied()
            .unwrap_or_default()
    }

    pub fn tracked(&self) -> usize {
        lock(&self.counts).len()
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.store_path else {
            return Ok(());
        };
        let _guard = lock(&self.persist_lock);
        let names = self.promoted();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            let data = serde_json::to_vec_pretty(&names)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(tmp_path, path)?;
        Ok(())
    }
}

fn read_promoted(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
