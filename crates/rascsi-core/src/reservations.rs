//! Reservation memo store.
//!
//! The engine owns which bus ids are reserved; this store owns the
//! human-readable memo attached to each reservation. Clones share the same
//! table, so one store is created at the composition root and handed to every
//! component that needs it. Tests create fresh stores.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::constants::BUS_ID_COUNT;
use crate::{Error, Result};

/// Bus id to memo table with exactly [`BUS_ID_COUNT`] entries.
#[derive(Debug, Clone, Default)]
pub struct ReservationStore {
    memos: Arc<Mutex<[String; BUS_ID_COUNT]>>,
}

impl ReservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, [String; BUS_ID_COUNT]> {
        // A panic while holding the lock cannot leave the table half-written.
        self.memos.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(id: u32) -> Result<usize> {
        let index = id as usize;
        if index >= BUS_ID_COUNT {
            return Err(Error::invalid_argument(format!(
                "bus id {} out of range 0..{}",
                id,
                BUS_ID_COUNT - 1
            )));
        }
        Ok(index)
    }

    /// Store a memo for `id`.
    pub fn set(&self, id: u32, memo: impl Into<String>) -> Result<()> {
        let index = Self::check(id)?;
        self.lock()[index] = memo.into();
        Ok(())
    }

    /// Clear the memo for `id`.
    pub fn clear(&self, id: u32) -> Result<()> {
        let index = Self::check(id)?;
        self.lock()[index].clear();
        Ok(())
    }

    /// Reset every entry to the empty string.
    pub fn clear_all(&self) {
        for memo in self.lock().iter_mut() {
            memo.clear();
        }
    }

    /// Memo for `id`; empty when none is set.
    pub fn get(&self, id: u32) -> Result<String> {
        let index = Self::check(id)?;
        Ok(self.lock()[index].clone())
    }

    /// Copy of the whole table.
    pub fn snapshot(&self) -> [String; BUS_ID_COUNT] {
        self.lock().clone()
    }

    /// Ids whose memo is non-empty, ascending.
    pub fn annotated_ids(&self) -> Vec<u32> {
        self.lock()
            .iter()
            .enumerate()
            .filter(|(_, memo)| !memo.is_empty())
            .map(|(id, _)| id as u32)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let store = ReservationStore::new();
        assert!(store.snapshot().iter().all(String::is_empty));
        assert!(store.annotated_ids().is_empty());
    }

    #[test]
    fn set_get_clear() {
        let store = ReservationStore::new();
        store.set(7, "backup").unwrap();
        assert_eq!(store.get(7).unwrap(), "backup");
        assert_eq!(store.annotated_ids(), vec![7]);

        store.clear(7).unwrap();
        assert_eq!(store.get(7).unwrap(), "");
    }

    #[test]
    fn clones_share_state() {
        let store = ReservationStore::new();
        let other = store.clone();
        other.set(2, "scanner").unwrap();
        assert_eq!(store.get(2).unwrap(), "scanner");

        store.clear_all();
        assert_eq!(other.get(2).unwrap(), "");
    }

    #[test]
    fn out_of_range_id_is_rejected() {
        let store = ReservationStore::new();
        assert!(store.set(8, "nope").is_err());
        assert!(store.get(100).is_err());
        assert!(store.clear(8).is_err());
    }
}
