//! Durable store seam used by the ingestion and query paths.

use std::path::Path;

use anyhow::Result;
use parking_lot::Mutex;

use crate::db::{Database, DbStats};
use crate::types::{Delivery, Item, Order, Payment};

/// Load/save operations the cache-aside core needs from durable storage.
///
/// Implementations must be shareable across ingestion and query workers.
/// Calls may block on I/O; callers never hold the cache lock across them.
pub trait OrderStore: Send + Sync {
    /// Composite read of order, items, delivery and payment. `None` if unknown.
    fn load_order(&self, order_uid: &str) -> Result<Option<Order>>;

    fn save_delivery(&self, delivery: &Delivery) -> Result<i64>;

    fn save_payment(&self, payment: &Payment) -> Result<i64>;

    fn save_order(
        &self,
        order: &Order,
        delivery_id: Option<i64>,
        payment_id: Option<i64>,
        item_ids: &[i64],
    ) -> Result<String>;

    fn save_item(&self, item: &Item, order_uid: &str) -> Result<i64>;

    /// First `limit` stored order ids, used to warm the cache.
    fn order_ids(&self, limit: usize) -> Result<Vec<String>>;

    fn count_orders(&self) -> Result<u64>;
}

/// [`OrderStore`] over a single SQLite connection guarded by a mutex.
#[derive(Debug)]
pub struct SqliteOrderStore {
    db: Mutex<Database>,
}

impl SqliteOrderStore {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Database::open(path)?))
    }

    #[doc(hidden)]
    pub fn open_memory() -> Result<Self> {
        Ok(Self::new(Database::open_memory()?))
    }

    pub fn stats(&self) -> Result<DbStats> {
        self.db.lock().stats()
    }
}

impl OrderStore for SqliteOrderStore {
    fn load_order(&self, order_uid: &str) -> Result<Option<Order>> {
        self.db.lock().load_order(order_uid)
    }

    fn save_delivery(&self, delivery: &Delivery) -> Result<i64> {
        self.db.lock().save_delivery(delivery)
    }

    fn save_payment(&self, payment: &Payment) -> Result<i64> {
        self.db.lock().save_payment(payment)
    }

    fn save_order(
        &self,
        order: &Order,
        delivery_id: Option<i64>,
        payment_id: Option<i64>,
        item_ids: &[i64],
    ) -> Result<String> {
        self.db
            .lock()
            .save_order(order, delivery_id, payment_id, item_ids)
    }

    fn save_item(&self, item: &Item, order_uid: &str) -> Result<i64> {
        self.db.lock().save_item(item, order_uid)
    }

    fn order_ids(&self, limit: usize) -> Result<Vec<String>> {
        self.db.lock().order_ids(limit)
    }

    fn count_orders(&self) -> Result<u64> {
        self.db.lock().count_orders()
    }
}
