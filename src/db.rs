use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::warn;

use crate::types::{Delivery, Item, Order, Payment};

const SQL_INSERT_ITEM: &str = "INSERT INTO items
     (order_uid, chrt_id, track_number, price, rid, name, sale, size,
      total_price, nm_id, brand, status)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";

const SQL_SELECT_ITEMS: &str = "SELECT chrt_id, track_number, price, rid, name, sale, size,
            total_price, nm_id, brand, status
     FROM items WHERE order_uid = ?1
     ORDER BY id";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS deliveries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    phone TEXT NOT NULL,
    zip TEXT NOT NULL,
    city TEXT NOT NULL,
    address TEXT NOT NULL,
    region TEXT NOT NULL,
    email TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS payments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    txn TEXT NOT NULL,
    request_id TEXT NOT NULL,
    currency TEXT NOT NULL,
    provider TEXT NOT NULL,
    amount INTEGER NOT NULL,
    payment_dt INTEGER NOT NULL,
    bank TEXT NOT NULL,
    delivery_cost INTEGER NOT NULL,
    goods_total INTEGER NOT NULL,
    custom_fee INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS orders (
    order_uid TEXT PRIMARY KEY,
    track_number TEXT NOT NULL,
    entry TEXT NOT NULL,
    delivery_id INTEGER,
    payment_id INTEGER,
    item_ids TEXT NOT NULL,
    locale TEXT NOT NULL,
    internal_signature TEXT NOT NULL,
    customer_id TEXT NOT NULL,
    delivery_service TEXT NOT NULL,
    shardkey TEXT NOT NULL,
    sm_id INTEGER NOT NULL,
    date_created TEXT NOT NULL,
    oof_shard TEXT NOT NULL,
    FOREIGN KEY (delivery_id) REFERENCES deliveries(id),
    FOREIGN KEY (payment_id) REFERENCES payments(id)
);

CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    order_uid TEXT NOT NULL,
    chrt_id INTEGER NOT NULL,
    track_number TEXT NOT NULL,
    price INTEGER NOT NULL,
    rid TEXT NOT NULL,
    name TEXT NOT NULL,
    sale INTEGER NOT NULL,
    size TEXT NOT NULL,
    total_price INTEGER NOT NULL,
    nm_id INTEGER NOT NULL,
    brand TEXT NOT NULL,
    status INTEGER NOT NULL,
    FOREIGN KEY (order_uid) REFERENCES orders(order_uid)
);

CREATE INDEX IF NOT EXISTS idx_items_order ON items(order_uid, chrt_id);
"#;

/// Default database filename.
pub const DB_FILE: &str = "orders.db";

/// SQLite-backed durable store for order aggregates.
///
/// An order is spread over four tables: the order row references its
/// delivery and payment rows by generated id and its items by `chrt_id`.
pub struct Database {
    conn: Connection,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

/// Row counts per table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DbStats {
    pub orders: u64,
    pub items: u64,
    pub deliveries: u64,
    pub payments: u64,
}

/// Raw order row: the core fields plus the ids it references.
struct OrderRow {
    order: Order,
    delivery_id: Option<i64>,
    payment_id: Option<i64>,
    item_ids: Vec<i64>,
}

impl Database {
    /// Open or create the database at the given path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).context("Failed to open database")?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;
             PRAGMA synchronous=NORMAL;",
        )
        .context("Failed to set pragmas")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to create schema")?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (for tests and benchmarks).
    #[doc(hidden)]
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    // ── Writes ──

    /// Insert a delivery row and return its generated id.
    pub fn save_delivery(&self, delivery: &Delivery) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO deliveries (name, phone, zip, city, address, region, email)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    delivery.name,
                    delivery.phone,
                    delivery.zip,
                    delivery.city,
                    delivery.address,
                    delivery.region,
                    delivery.email,
                ],
            )
            .context("Failed to insert delivery")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Insert a payment row and return its generated id.
    pub fn save_payment(&self, payment: &Payment) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO payments (txn, request_id, currency, provider, amount, payment_dt,
                                       bank, delivery_cost, goods_total, custom_fee)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    payment.transaction,
                    payment.request_id,
                    payment.currency,
                    payment.provider,
                    payment.amount,
                    payment.payment_dt,
                    payment.bank,
                    payment.delivery_cost,
                    payment.goods_total,
                    payment.custom_fee,
                ],
            )
            .context("Failed to insert payment")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Insert the order row referencing already-saved delivery/payment rows.
    ///
    /// Either reference may be absent when its own insert failed. `item_ids`
    /// is the ordered list of `chrt_id`s the items will be saved under.
    /// Fails if `order_uid` is already stored.
    pub fn save_order(
        &self,
        order: &Order,
        delivery_id: Option<i64>,
        payment_id: Option<i64>,
        item_ids: &[i64],
    ) -> Result<String> {
        let item_ids = serde_json::to_string(item_ids)?;
        self.conn
            .execute(
                "INSERT INTO orders (order_uid, track_number, entry, delivery_id, payment_id,
                                     item_ids, locale, internal_signature, customer_id,
                                     delivery_service, shardkey, sm_id, date_created, oof_shard)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    order.order_uid,
                    order.track_number,
                    order.entry,
                    delivery_id,
                    payment_id,
                    item_ids,
                    order.locale,
                    order.internal_signature,
                    order.customer_id,
                    order.delivery_service,
                    order.shardkey,
                    order.sm_id,
                    order.date_created,
                    order.oof_shard,
                ],
            )
            .with_context(|| format!("Failed to insert order {}", order.order_uid))?;
        Ok(order.order_uid.clone())
    }

    /// Insert one item row belonging to `order_uid` and return its row id.
    pub fn save_item(&self, item: &Item, order_uid: &str) -> Result<i64> {
        self.conn
            .prepare_cached(SQL_INSERT_ITEM)?
            .execute(params![
                order_uid,
                item.chrt_id,
                item.track_number,
                item.price,
                item.rid,
                item.name,
                item.sale,
                item.size,
                item.total_price,
                item.nm_id,
                item.brand,
                item.status,
            ])
            .with_context(|| format!("Failed to insert item {}", item.chrt_id))?;
        Ok(self.conn.last_insert_rowid())
    }

    // ── Reads ──

    /// Assemble the full aggregate for `order_uid`, or `None` if no order row exists.
    ///
    /// Reads the order row, then each referenced item in list order, then the
    /// delivery and payment rows. A dangling reference leaves that part at its
    /// zero value.
    pub fn load_order(&self, order_uid: &str) -> Result<Option<Order>> {
        let Some(row) = self.order_row(order_uid)? else {
            return Ok(None);
        };
        let mut order = row.order;

        // Each referenced id consumes the oldest unclaimed row with that chrt_id,
        // so repeated ids map onto distinct rows in save order.
        let mut rows: Vec<Option<Item>> = self
            .conn
            .prepare_cached(SQL_SELECT_ITEMS)?
            .query_map(params![order_uid], |r| row_to_item(r).map(Some))?
            .collect::<rusqlite::Result<_>>()
            .context("Failed to query items")?;
        for chrt_id in &row.item_ids {
            let item = rows
                .iter_mut()
                .find(|slot| slot.as_ref().is_some_and(|item| item.chrt_id == *chrt_id))
                .and_then(Option::take);
            match item {
                Some(item) => order.items.push(item),
                None => warn!(order_uid, chrt_id, "referenced item row missing"),
            }
        }

        if let Some(id) = row.delivery_id {
            order.delivery = self
                .conn
                .query_row(
                    "SELECT name, phone, zip, city, address, region, email
                     FROM deliveries WHERE id = ?1",
                    params![id],
                    row_to_delivery,
                )
                .optional()
                .context("Failed to query delivery")?
                .unwrap_or_default();
        }

        if let Some(id) = row.payment_id {
            order.payment = self
                .conn
                .query_row(
                    "SELECT txn, request_id, currency, provider, amount, payment_dt,
                            bank, delivery_cost, goods_total, custom_fee
                     FROM payments WHERE id = ?1",
                    params![id],
                    row_to_payment,
                )
                .optional()
                .context("Failed to query payment")?
                .unwrap_or_default();
        }

        Ok(Some(order))
    }

    fn order_row(&self, order_uid: &str) -> Result<Option<OrderRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT order_uid, track_number, entry, delivery_id, payment_id, item_ids,
                        locale, internal_signature, customer_id, delivery_service,
                        shardkey, sm_id, date_created, oof_shard
                 FROM orders WHERE order_uid = ?1",
                params![order_uid],
                |row| {
                    let date_created: DateTime<Utc> = row.get(12)?;
                    let order = Order {
                        order_uid: row.get(0)?,
                        track_number: row.get(1)?,
                        entry: row.get(2)?,
                        locale: row.get(6)?,
                        internal_signature: row.get(7)?,
                        customer_id: row.get(8)?,
                        delivery_service: row.get(9)?,
                        shardkey: row.get(10)?,
                        sm_id: row.get(11)?,
                        date_created,
                        oof_shard: row.get(13)?,
                        ..Order::default()
                    };
                    Ok((
                        order,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query order")?;

        let Some((order, delivery_id, payment_id, item_ids)) = row else {
            return Ok(None);
        };
        let item_ids: Vec<i64> = serde_json::from_str(&item_ids)
            .with_context(|| format!("Corrupt item list for order {order_uid}"))?;

        Ok(Some(OrderRow {
            order,
            delivery_id,
            payment_id,
            item_ids,
        }))
    }

    /// First `limit` stored order ids, in insertion order.
    pub fn order_ids(&self, limit: usize) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT order_uid FROM orders ORDER BY rowid LIMIT ?1")?;
        let ids = stmt
            .query_map(params![limit as i64], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    pub fn count_orders(&self) -> Result<u64> {
        self.count("orders")
    }

    /// Row counts for every table.
    pub fn stats(&self) -> Result<DbStats> {
        Ok(DbStats {
            orders: self.count("orders")?,
            items: self.count("items")?,
            deliveries: self.count("deliveries")?,
            payments: self.count("payments")?,
        })
    }

    fn count(&self, table: &str) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .with_context(|| format!("Failed to count {table}"))?;
        Ok(n as u64)
    }
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<Item> {
    Ok(Item {
        chrt_id: row.get(0)?,
        track_number: row.get(1)?,
        price: row.get(2)?,
        rid: row.get(3)?,
        name: row.get(4)?,
        sale: row.get(5)?,
        size: row.get(6)?,
        total_price: row.get(7)?,
        nm_id: row.get(8)?,
        brand: row.get(9)?,
        status: row.get(10)?,
    })
}

fn row_to_delivery(row: &rusqlite::Row<'_>) -> rusqlite::Result<Delivery> {
    Ok(Delivery {
        name: row.get(0)?,
        phone: row.get(1)?,
        zip: row.get(2)?,
        city: row.get(3)?,
        address: row.get(4)?,
        region: row.get(5)?,
        email: row.get(6)?,
    })
}

fn row_to_payment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Payment> {
    Ok(Payment {
        transaction: row.get(0)?,
        request_id: row.get(1)?,
        currency: row.get(2)?,
        provider: row.get(3)?,
        amount: row.get(4)?,
        payment_dt: row.get(5)?,
        bank: row.get(6)?,
        delivery_cost: row.get(7)?,
        goods_total: row.get(8)?,
        custom_fee: row.get(9)?,
    })
}
