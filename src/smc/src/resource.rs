use std::collections::hash_map;
use std::hash::Hash;
use std::sync::Arc;

use fnv::FnvHashMap as HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Resource not found in the table")]
    NotFound,
    #[error("Resource exists in the table")]
    Exists,
}

/// A table of shared objects keyed by id.
///
/// The lock is only held to touch the map itself; callers get an `Arc` back and work on the
/// object with the table unlocked.
#[derive(Debug)]
pub(crate) struct ResourceTable<K, R> {
    table: spin::Mutex<HashMap<K, Arc<R>>>,
}

impl<K, R> Default for ResourceTable<K, R> {
    fn default() -> Self {
        ResourceTable {
            table: spin::Mutex::new(HashMap::default()),
        }
    }
}

impl<K: Eq + Hash + Copy, R> ResourceTable<K, R> {
    pub(crate) fn insert(&self, k: K, r: Arc<R>) -> Result<(), Error> {
        match self.table.lock().entry(k) {
            hash_map::Entry::Occupied(_) => Err(Error::Exists),
            hash_map::Entry::Vacant(e) => {
                e.insert(r);
                Ok(())
            }
        }
    }

    pub(crate) fn get(&self, k: &K) -> Result<Arc<R>, Error> {
        self.table
            .lock()
            .get(k)
            .map(Arc::clone)
            .ok_or(Error::NotFound)
    }

    pub(crate) fn remove(&self, k: &K) -> Result<Arc<R>, Error> {
        self.table.lock().remove(k).ok_or(Error::NotFound)
    }

    /// A point-in-time copy of every entry matching `pred`.
    pub(crate) fn collect<F>(&self, mut pred: F) -> Vec<Arc<R>>
    where
        F: FnMut(&R) -> bool,
    {
        self.table
            .lock()
            .values()
            .filter(|r| pred(r))
            .map(Arc::clone)
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.table.lock().len()
    }
}
