//! Order record persistence contract.

use std::collections::HashMap;

use uuid::Uuid;

use crate::order::OrderRecord;
use crate::storage::Result;

/// Rank-indexed access to a contact's order records: rank 0 is the most
/// recent record (largest `order`), rank `count - 1` the least recent.
/// The core never requires a full scan.
pub trait MessageOrderStore {
    fn most_recent(&self, contact_id: Uuid) -> Result<Option<OrderRecord>>;
    fn least_recent(&self, contact_id: Uuid) -> Result<Option<OrderRecord>>;
    fn count(&self, contact_id: Uuid) -> Result<usize>;
    fn get_at_rank(&self, contact_id: Uuid, rank: usize) -> Result<Option<OrderRecord>>;
    fn insert(&mut self, contact_id: Uuid, record: OrderRecord) -> Result<()>;
}

/// In-memory [`MessageOrderStore`], kept sorted by descending `order`.
#[derive(Default)]
pub struct MemoryOrderStore {
    records: HashMap<Uuid, Vec<OrderRecord>>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageOrderStore for MemoryOrderStore {
    fn most_recent(&self, contact_id: Uuid) -> Result<Option<OrderRecord>> {
        Ok(self.records.get(&contact_id).and_then(|r| r.first()).cloned())
    }

    fn least_recent(&self, contact_id: Uuid) -> Result<Option<OrderRecord>> {
        Ok(self.records.get(&contact_id).and_then(|r| r.last()).cloned())
    }

    fn count(&self, contact_id: Uuid) -> Result<usize> {
        Ok(self.records.get(&contact_id).map_or(0, Vec::len))
    }

    fn get_at_rank(&self, contact_id: Uuid, rank: usize) -> Result<Option<OrderRecord>> {
        Ok(self.records.get(&contact_id).and_then(|r| r.get(rank)).cloned())
    }

    fn insert(&mut self, contact_id: Uuid, record: OrderRecord) -> Result<()> {
        let records = self.records.entry(contact_id).or_default();
        let at = records
            .iter()
            .position(|r| r.order < record.order)
            .unwrap_or(records.len());
        records.insert(at, record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(order: f64) -> OrderRecord {
        OrderRecord {
            message_id: Uuid::new_v4(),
            enc_sent_at: vec![0u8; 4],
            order,
        }
    }

    #[test]
    fn test_empty_store() {
        let store = MemoryOrderStore::new();
        let contact = Uuid::new_v4();
        assert_eq!(store.count(contact).unwrap(), 0);
        assert!(store.most_recent(contact).unwrap().is_none());
        assert!(store.least_recent(contact).unwrap().is_none());
        assert!(store.get_at_rank(contact, 0).unwrap().is_none());
    }

    #[test]
    fn test_rank_order_is_descending() {
        let mut store = MemoryOrderStore::new();
        let contact = Uuid::new_v4();
        for order in [0.0, 1.0, 0.5, -1.0, 2.0] {
            store.insert(contact, record(order)).unwrap();
        }

        assert_eq!(store.count(contact).unwrap(), 5);
        assert_eq!(store.most_recent(contact).unwrap().unwrap().order, 2.0);
        assert_eq!(store.least_recent(contact).unwrap().unwrap().order, -1.0);

        let orders: Vec<f64> = (0..5)
            .map(|rank| store.get_at_rank(contact, rank).unwrap().unwrap().order)
            .collect();
        assert_eq!(orders, vec![2.0, 1.0, 0.5, 0.0, -1.0]);
    }

    #[test]
    fn test_contacts_are_independent() {
        let mut store = MemoryOrderStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.insert(a, record(1.0)).unwrap();
        assert_eq!(store.count(a).unwrap(), 1);
        assert_eq!(store.count(b).unwrap(), 0);
    }
}
