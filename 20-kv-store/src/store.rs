//! In-memory key-value storage shared by every connection.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Thread-safe map from string keys to opaque byte values.
///
/// One lock guards the whole map. Every mutation wakes all tasks parked in
/// [`KvStore::get_when`] so they can re-check their condition. The lock is
/// never held across an `.await`.
#[derive(Default)]
pub struct KvStore {
    data: Mutex<HashMap<String, Vec<u8>>>,
    changed: Notify,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value, overwriting any existing one.
    pub fn put(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.data.lock().insert(key.into(), value.into());
        self.changed.notify_waiters();
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.lock().get(key).cloned()
    }

    /// Applies every pair in one critical section, then wakes waiters once.
    pub fn multi_put<I>(&self, pairs: I)
    where
        I: IntoIterator<Item = (String, Vec<u8>)>,
    {
        self.data.lock().extend(pairs);
        self.changed.notify_waiters();
    }

    /// Looks up each key independently; missing keys map to `None`.
    pub fn multi_get<'a, I>(&self, keys: I) -> BTreeMap<String, Option<Vec<u8>>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let data = self.data.lock();
        keys.into_iter()
            .map(|key| (key.to_string(), data.get(key).cloned()))
            .collect()
    }

    /// Waits until `cond_key` holds exactly `cond_value`, then returns the
    /// current value of `key`.
    ///
    /// Both reads happen under the same lock acquisition, so the result is
    /// the value of `key` at an instant when the condition held. There is no
    /// timeout; dropping the future is the only way to give up.
    pub async fn get_when(&self, key: &str, cond_key: &str, cond_value: &[u8]) -> Option<Vec<u8>> {
        loop {
            // Register for the next change before checking, so a write that
            // lands between the check and the await still wakes us.
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            {
                let data = self.data.lock();
                if data.get(cond_key).map(Vec::as_slice) == Some(cond_value) {
                    return data.get(key).cloned();
                }
            }

            changed.await;
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}
