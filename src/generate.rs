//! Synthetic orders for exercising the ingestion path.

use chrono::{Duration, Utc};
use rand::Rng;

use crate::types::{Delivery, Item, Order, Payment};

/// Upper bound (exclusive) on the number of items per generated order.
pub const MAX_ITEMS: usize = 10;

/// Build a random order with every field populated.
///
/// Each entity draws one number `n`; text fields are `"<field><n>"` and
/// numeric fields are `n`, which makes stored rows easy to eyeball.
pub fn generate_order<R: Rng + ?Sized>(rng: &mut R) -> Order {
    let n: u32 = rng.gen();
    let items = rng.gen_range(0..MAX_ITEMS);
    let tag = |field: &str| format!("{field}{n}");

    Order {
        order_uid: tag("orderUID"),
        track_number: tag("trackNumber"),
        entry: tag("entry"),
        delivery: generate_delivery(rng),
        payment: generate_payment(rng),
        items: (0..items).map(|_| generate_item(rng)).collect(),
        locale: tag("locale"),
        internal_signature: tag("internalSignature"),
        customer_id: tag("customerID"),
        delivery_service: tag("deliveryService"),
        shardkey: tag("shardkey"),
        sm_id: i64::from(n),
        date_created: Utc::now() + Duration::milliseconds(i64::from(n % 1_000_000)),
        oof_shard: tag("oofShard"),
    }
}

fn generate_delivery<R: Rng + ?Sized>(rng: &mut R) -> Delivery {
    let n: u32 = rng.gen();
    Delivery {
        name: format!("name{n}"),
        phone: format!("phone{n}"),
        zip: format!("zip{n}"),
        city: format!("city{n}"),
        address: format!("address{n}"),
        region: format!("region{n}"),
        email: format!("email{n}"),
    }
}

fn generate_payment<R: Rng + ?Sized>(rng: &mut R) -> Payment {
    let n: u32 = rng.gen();
    let v = i64::from(n);
    Payment {
        transaction: format!("transaction{n}"),
        request_id: format!("requestID{n}"),
        currency: format!("currency{n}"),
        provider: format!("provider{n}"),
        amount: v,
        payment_dt: v,
        bank: format!("bank{n}"),
        delivery_cost: v,
        goods_total: v,
        custom_fee: v,
    }
}

fn generate_item<R: Rng + ?Sized>(rng: &mut R) -> Item {
    let n: u32 = rng.gen();
    let v = i64::from(n);
    Item {
        chrt_id: v,
        track_number: format!("trackNumber{n}"),
        price: v,
        rid: format!("rid{n}"),
        name: format!("name{n}"),
        sale: v,
        size: format!("size{n}"),
        total_price: v,
        nm_id: v,
        brand: format!("brand{n}"),
        status: v,
    }
}
