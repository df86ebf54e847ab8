use crate::doc_cache::lock;
use crate::model::RequestKey;
use crate::model::ResolutionResult;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

struct CachedResult {
    result: Arc<ResolutionResult>,
    expires_at: Instant,
}

/// TTL cache of merged answers. Entries are replaced, never mutated.
#[derive(Default)]
pub struct ResultCache {
    entries: Mutex<HashMap<RequestKey, CachedResult>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &RequestKey) -> Option<Arc<ResolutionResult>> {
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(Arc::clone(&entry.result)),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Stores `result` for its own TTL, replacing any previous entry.
    pub fn insert(&self, result: Arc<ResolutionResult>) {
        let expires_at = Instant::now() + result.ttl;
        lock(&self.entries).insert(
            result.key.clone(),
            CachedResult { result, expires_at },
        );
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::date;
    use crate::tier::Tier;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn result(entity: &str, ttl: Duration) -> Arc<ResolutionResult> {
        Arc::new(ResolutionResult {
            key: RequestKey::new(entity, date(1, 5, 2025), date(3, 5, 2025)),
            days: BTreeMap::new(),
            text: format!("{entity} text"),
            computed_at: Utc::now(),
            ttl,
            tier: Tier::Indexed,
            complete: true,
        })
    }

    #[test]
    fn hit_within_ttl_and_replace_on_insert() {
        let cache = ResultCache::new();
        cache.insert(result("Иванов И.И.", Duration::from_secs(60)));
        let key = RequestKey::new("Иванов  И. И.", date(1, 5, 2025), date(3, 5, 2025));
        assert_eq!(
            cache.get(&key).map(|hit| hit.text.clone()),
            Some("Иванов И.И. text".to_string())
        );

        let mut replacement = (*result("Иванов И.И.", Duration::from_secs(60))).clone();
        replacement.text = "updated".to_string();
        cache.insert(Arc::new(replacement));
        assert_eq!(cache.get(&key).map(|hit| hit.text.clone()), Some("updated".to_string()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn expired_entries_miss_and_purge() {
        let cache = ResultCache::new();
        cache.insert(result("Иванов И.И.", Duration::ZERO));
        cache.insert(result("Петров П.П.", Duration::from_secs(60)));
        assert_eq!(cache.purge_expired(), 1);
        let key = RequestKey::new("Иванов И.И.", date(1, 5, 2025), date(3, 5, 2025));
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.len(), 1);
    }
}
