use crate::common::hash_customer_id;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A customer's at-rest record: identity plus the LZ4 column blob the
/// Grid decompresses on mount. Commit builds a fresh one and the People
/// store swaps the pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerData {
    pub id_hash: i64,
    pub id: String,
    pub linear_id: usize,
    pub flags: u32,
    pub blob: Vec<u8>,
}

/// Serialized people store for replica transfer.
#[derive(Serialize, Deserialize)]
pub struct PeopleTransfer {
    pub customers: Vec<Option<CustomerData>>,
}

/// Per-partition customer registry. Linear ids are dense, assigned at
/// first insert, and are the bit positions in every bitmap on the
/// partition. Dropped customers leave a vacant slot; the linear id is
/// never reused (bitmaps would lie).
pub struct People {
    partition: usize,
    customers: Vec<Option<Arc<CustomerData>>>,
    by_id: HashMap<i64, usize>,
}

impl People {
    pub fn new(partition: usize) -> Self {
        Self {
            partition,
            customers: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    /// Number of linear ids issued; the stop bit for every bitmap scan.
    pub fn customer_count(&self) -> usize {
        self.customers.len()
    }

    pub fn get_by_id(&self, id: &str) -> Option<Arc<CustomerData>> {
        let hash = hash_customer_id(id);
        self.by_id
            .get(&hash)
            .and_then(|&lin| self.customers[lin].clone())
    }

    pub fn get_by_lin(&self, linear_id: usize) -> Option<Arc<CustomerData>> {
        self.customers.get(linear_id).and_then(|slot| slot.clone())
    }

    /// Find or create the record for an external id. New customers get
    /// the next dense linear id and an empty blob.
    pub fn get_make(&mut self, id: &str) -> Arc<CustomerData> {
        let hash = hash_customer_id(id);
        if let Some(&lin) = self.by_id.get(&hash) {
            if let Some(existing) = &self.customers[lin] {
                return existing.clone();
            }
        }

        let linear_id = self.customers.len();
        let record = Arc::new(CustomerData {
            id_hash: hash,
            id: id.to_lowercase(),
            linear_id,
            flags: 0,
            blob: Vec::new(),
        });
        self.customers.push(Some(record.clone()));
        self.by_id.insert(hash, linear_id);
        record
    }

    /// Swap in the record produced by a grid commit.
    pub fn replace(&mut self, record: Arc<CustomerData>) {
        let lin = record.linear_id;
        if lin < self.customers.len() {
            self.by_id.insert(record.id_hash, lin);
            self.customers[lin] = Some(record);
        }
    }

    /// Drop a customer whose grid emptied after a cull. The slot stays
    /// vacant so linear ids keep their meaning.
    pub fn drop_customer(&mut self, id_hash: i64) {
        if let Some(lin) = self.by_id.remove(&id_hash) {
            self.customers[lin] = None;
        }
    }

    pub fn to_transfer(&self) -> PeopleTransfer {
        PeopleTransfer {
            customers: self
                .customers
                .iter()
                .map(|slot| slot.as_ref().map(|c| (**c).clone()))
                .collect(),
        }
    }

    pub fn from_transfer(&mut self, transfer: PeopleTransfer) {
        self.customers = transfer
            .customers
            .into_iter()
            .map(|slot| slot.map(Arc::new))
            .collect();
        self.by_id = self
            .customers
            .iter()
            .enumerate()
            .filter_map(|(lin, slot)| slot.as_ref().map(|c| (c.id_hash, lin)))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_ids_dense_and_stable() {
        let mut people = People::new(0);
        let a = people.get_make("a@x.com");
        let b = people.get_make("b@x.com");
        assert_eq!(a.linear_id, 0);
        assert_eq!(b.linear_id, 1);
        // same id resolves to the same record
        assert_eq!(people.get_make("A@X.com").linear_id, 0);
        assert_eq!(people.customer_count(), 2);
    }

    #[test]
    fn test_drop_leaves_vacant_slot() {
        let mut people = People::new(0);
        let a = people.get_make("a");
        people.get_make("b");
        people.drop_customer(a.id_hash);
        assert!(people.get_by_lin(0).is_none());
        assert!(people.get_by_id("a").is_none());
        // count (and therefore the stop bit) is unchanged
        assert_eq!(people.customer_count(), 2);
    }
}
