//! In-flight transaction registry
//!
//! Concurrency-safe correlation-id map shared by every stream. TTL
//! eviction keeps abandoned streams from growing memory unbounded;
//! eviction only drops the registry's reference, the owning stream
//! still tears its transaction down.

use crate::engine::RuleEngine;
use crate::inspect::transaction::Transaction;
use crate::{Result, WafError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

struct Slot {
    tx: Arc<Mutex<Transaction>>,
    touched: Instant,
}

/// Registry of active transactions keyed by correlation id.
pub struct TransactionRegistry {
    entries: DashMap<String, Slot>,
    ttl: Duration,
}

impl TransactionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Opens an engine transaction under `id` and registers it.
    pub fn create(&self, id: &str, engine: &dyn RuleEngine) -> Result<Arc<Mutex<Transaction>>> {
        self.evict_expired();
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(_) => Err(WafError::DuplicateTransaction(id.to_string())),
            Entry::Vacant(vacant) => {
                let tx = Arc::new(Mutex::new(Transaction::new(id, engine.open_transaction(id))));
                vacant.insert(Slot {
                    tx: Arc::clone(&tx),
                    touched: Instant::now(),
                });
                Ok(tx)
            }
        }
    }

    pub fn lookup(&self, id: &str) -> Result<Arc<Mutex<Transaction>>> {
        match self.entries.get_mut(id) {
            Some(mut slot) => {
                slot.touched = Instant::now();
                Ok(Arc::clone(&slot.tx))
            }
            None => Err(WafError::UnknownTransaction(id.to_string())),
        }
    }

    /// Removes `id`; releasing an already-evicted id is a no-op.
    pub fn release(&self, id: &str) {
        self.entries.remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_expired(&self) {
        let ttl = self.ttl;
        self.entries.retain(|id, slot| {
            let keep = slot.touched.elapsed() < ttl;
            if !keep {
                debug!(id = %id, "evicting expired transaction");
            }
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::MockEngine;

    #[test]
    fn test_create_and_lookup() {
        let engine = MockEngine::allowing();
        let registry = TransactionRegistry::new(Duration::from_secs(60));

        let created = registry.create("abc-1", &engine).unwrap();
        let found = registry.lookup("abc-1").unwrap();
        assert!(Arc::ptr_eq(&created, &found));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let engine = MockEngine::allowing();
        let registry = TransactionRegistry::new(Duration::from_secs(60));

        registry.create("abc-1", &engine).unwrap();
        assert!(matches!(
            registry.create("abc-1", &engine),
            Err(WafError::DuplicateTransaction(_))
        ));
    }

    #[test]
    fn test_unknown_id() {
        let registry = TransactionRegistry::new(Duration::from_secs(60));
        assert!(matches!(
            registry.lookup("nope"),
            Err(WafError::UnknownTransaction(_))
        ));
    }

    #[test]
    fn test_release_is_idempotent() {
        let engine = MockEngine::allowing();
        let registry = TransactionRegistry::new(Duration::from_secs(60));

        registry.create("abc-1", &engine).unwrap();
        registry.release("abc-1");
        registry.release("abc-1");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_ttl_eviction() {
        let engine = MockEngine::allowing();
        let registry = TransactionRegistry::new(Duration::from_millis(0));

        registry.create("stale", &engine).unwrap();
        // Next create runs opportunistic eviction of expired entries.
        registry.create("fresh", &engine).unwrap();
        assert!(registry.lookup("stale").is_err());
        assert!(registry.lookup("fresh").is_ok());
    }
}
