//! # Entity Cache
//!
//! Process-wide memoization of store rows. An entity may be reachable under
//! two keys (its identifier and a natural key such as an email address); both
//! keys point at the *same* `Arc`, so a change made through one lookup is
//! visible through the other. Key maintenance happens under one lock, so no
//! reader can observe an entry indexed under only one of its keys.
//!
//! The cache is only filled by lookups through the connection manager and is
//! never invalidated proactively; mutation paths update the shared instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::warn;

/// A cached entity shared between every key and every caller holding it.
pub type Shared<E> = Arc<RwLock<E>>;

/// How an entity is indexed.
pub trait CacheKeys {
    fn primary_key(&self) -> String;

    fn secondary_key(&self) -> Option<String> {
        None
    }
}

#[derive(Debug)]
pub struct EntityCache<E> {
    entries: Mutex<HashMap<String, Shared<E>>>,
}

impl<E> Default for EntityCache<E> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<E: CacheKeys> EntityCache<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Shared<E>> {
        self.entries
            .lock()
            .expect("Entity cache lock poisoned")
            .get(key)
            .cloned()
    }

    /// Indexes `entity` under all of its keys and returns the shared instance.
    ///
    /// If another caller already cached the same primary key, that instance
    /// wins and is returned instead, keeping one instance per entity.
    pub fn insert(&self, entity: E) -> Shared<E> {
        let primary = entity.primary_key();
        let secondary = entity.secondary_key();

        let mut entries = self.entries.lock().expect("Entity cache lock poisoned");
        if let Some(existing) = entries.get(&primary) {
            return Arc::clone(existing);
        }

        let shared = Arc::new(RwLock::new(entity));
        entries.insert(primary, Arc::clone(&shared));
        if let Some(secondary) = secondary {
            entries.insert(secondary, Arc::clone(&shared));
        }
        shared
    }

    /// Mutates the entity found under `key` in place and re-indexes it if its
    /// secondary key changed. A new secondary key already held by another
    /// entity is left alone. Returns `None` when nothing is cached under `key`.
    pub fn update<F, R>(&self, key: &str, mutate: F) -> Option<R>
    where
        F: FnOnce(&mut E) -> R,
    {
        let mut entries = self.entries.lock().expect("Entity cache lock poisoned");
        let shared = Arc::clone(entries.get(key)?);

        let (result, old_secondary, new_secondary) = {
            let mut entity = shared.write().expect("Cache entry lock poisoned");
            let old_secondary = entity.secondary_key();
            let result = mutate(&mut entity);
            (result, old_secondary, entity.secondary_key())
        };

        if old_secondary != new_secondary {
            if let Some(old) = old_secondary {
                entries.remove(&old);
            }
            if let Some(new) = new_secondary {
                match entries.get(&new) {
                    Some(holder) if !Arc::ptr_eq(holder, &shared) => {
                        warn!(
                            "Cache key {} already belongs to another entity; not re-indexing",
                            new
                        );
                    }
                    _ => {
                        entries.insert(new, shared);
                    }
                }
            }
        }
        Some(result)
    }

    /// Drops the entity found under `key` from every key it is indexed under.
    pub fn remove(&self, key: &str) -> Option<Shared<E>> {
        let mut entries = self.entries.lock().expect("Entity cache lock poisoned");
        let shared = entries.remove(key)?;
        let (primary, secondary) = {
            let entity = shared.read().expect("Cache entry lock poisoned");
            (entity.primary_key(), entity.secondary_key())
        };
        entries.remove(&primary);
        if let Some(secondary) = secondary {
            entries.remove(&secondary);
        }
        Some(shared)
    }

    /// Empties the cache, returning how many keys were dropped.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock().expect("Entity cache lock poisoned");
        let count = entries.len();
        entries.clear();
        count
    }

    /// Number of keys, not entities.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("Entity cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Member {
        id: String,
        email: String,
        flags: u32,
    }

    impl CacheKeys for Member {
        fn primary_key(&self) -> String {
            self.id.clone()
        }

        fn secondary_key(&self) -> Option<String> {
            Some(self.email.clone())
        }
    }

    fn member() -> Member {
        Member {
            id: "2b1e6a3c-0000-4000-8000-000000000001".into(),
            email: "ann@example.com".into(),
            flags: 0,
        }
    }

    #[test]
    fn test_both_keys_resolve_to_one_instance() {
        let cache = EntityCache::new();
        let inserted = cache.insert(member());

        let by_id = cache.get("2b1e6a3c-0000-4000-8000-000000000001").unwrap();
        let by_email = cache.get("ann@example.com").unwrap();
        assert!(Arc::ptr_eq(&by_id, &by_email));
        assert!(Arc::ptr_eq(&by_id, &inserted));

        by_email.write().unwrap().flags = 7;
        assert_eq!(by_id.read().unwrap().flags, 7);
    }

    #[test]
    fn test_second_insert_keeps_the_first_instance() {
        let cache = EntityCache::new();
        let first = cache.insert(member());
        let mut again = member();
        again.flags = 99;
        let second = cache.insert(again);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.read().unwrap().flags, 0);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_update_moves_the_secondary_key() {
        let cache = EntityCache::new();
        cache.insert(member());

        let flags = cache.update("ann@example.com", |m| {
            m.email = "ann@example.org".into();
            m.flags = 3;
            m.flags
        });
        assert_eq!(flags, Some(3));
        assert!(cache.get("ann@example.com").is_none());
        let moved = cache.get("ann@example.org").unwrap();
        let by_id = cache.get("2b1e6a3c-0000-4000-8000-000000000001").unwrap();
        assert!(Arc::ptr_eq(&moved, &by_id));
        assert_eq!(cache.update("nobody", |m| m.flags), None);
    }

    #[test]
    fn test_update_never_steals_another_entitys_key() {
        let cache = EntityCache::new();
        let ann = cache.insert(member());
        cache.insert(Member {
            id: "2b1e6a3c-0000-4000-8000-000000000002".into(),
            email: "bob@example.com".into(),
            flags: 0,
        });

        cache.update("bob@example.com", |m| m.email = "ann@example.com".into());

        let holder = cache.get("ann@example.com").unwrap();
        assert!(Arc::ptr_eq(&holder, &ann));
        assert!(cache.get("bob@example.com").is_none());
        let bob = cache.get("2b1e6a3c-0000-4000-8000-000000000002").unwrap();
        assert_eq!(bob.read().unwrap().email, "ann@example.com");
    }

    #[test]
    fn test_remove_and_clear_drop_every_key() {
        let cache = EntityCache::new();
        cache.insert(member());
        assert!(cache.remove("ann@example.com").is_some());
        assert!(cache.is_empty());

        cache.insert(member());
        assert_eq!(cache.clear(), 2);
        assert!(cache.get("ann@example.com").is_none());
    }
}
