use crate::models::Zone;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Registre par zone, créé au premier message reçu.
///
/// Le verrou du registre n'est tenu que pendant la recherche/insertion ;
/// chaque entrée a son propre verrou pour que deux zones avancent en parallèle.
pub struct ZoneCache<T> {
    entries: Mutex<HashMap<Zone, Shared<T>>>,
}

impl<T> ZoneCache<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Retourne l'entrée de la zone, en la construisant si absente.
    /// Si `init` échoue rien n'est inséré.
    pub fn get_or_try_insert_with<E>(
        &self,
        zone: &Zone,
        init: impl FnOnce() -> Result<T, E>,
    ) -> Result<Shared<T>, E> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(zone) {
            return Ok(entry.clone());
        }
        let entry = new_state(init()?);
        entries.insert(zone.clone(), entry.clone());
        Ok(entry)
    }

    pub fn get(&self, zone: &Zone) -> Option<Shared<T>> {
        self.entries.lock().get(zone).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<T> Default for ZoneCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_miss_builds_once() {
        let cache: ZoneCache<u32> = ZoneCache::new();
        let zone = Zone::new("gh1", "rb1");
        let mut builds = 0;
        let a = cache
            .get_or_try_insert_with::<()>(&zone, || {
                builds += 1;
                Ok(7)
            })
            .unwrap();
        *a.lock() += 1;
        let b = cache.get_or_try_insert_with::<()>(&zone, || Ok(0)).unwrap();
        assert_eq!(*b.lock(), 8);
        assert_eq!(builds, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failed_init_is_not_cached() {
        let cache: ZoneCache<u32> = ZoneCache::new();
        let zone = Zone::new("gh1", "rb1");
        assert!(cache.get_or_try_insert_with(&zone, || Err("no thresholds")).is_err());
        assert!(cache.get(&zone).is_none());
        assert!(cache.is_empty());
    }
}
