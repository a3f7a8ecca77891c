use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bus::BusPublisher;
use crate::generate::generate_order;
use crate::server::{self, ServeConfig, Server};
use crate::store::{OrderStore, SqliteOrderStore};

fn open_store(db: &Path) -> Result<SqliteOrderStore> {
    SqliteOrderStore::open(db)
        .with_context(|| format!("Failed to open order store at {}", db.display()))
}

/// Print `data` as pretty JSON if `json` is true, otherwise call `human_fmt`.
fn output<T: Serialize>(data: &T, json: bool, human_fmt: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(data)?);
    } else {
        human_fmt(data);
    }
    Ok(())
}

/// Run the bus subscriber and HTTP server until Ctrl+C.
pub async fn cmd_serve(config: ServeConfig) -> Result<()> {
    let shutdown = CancellationToken::new();
    let server = Server::bind(config, shutdown.clone()).await?;
    info!(
        http = %server.http_addr()?,
        bus = %server.bus_addr()?,
        "order cache ready"
    );
    server::cancel_on_ctrl_c(shutdown);
    server.run().await
}

#[derive(Debug, Serialize)]
struct PublishSummary {
    published: usize,
    order_uids: Vec<String>,
}

/// Publish `count` synthetic orders, pausing `interval` between sends.
pub async fn cmd_publish(bus_addr: &str, count: u32, interval: Duration, json: bool) -> Result<()> {
    let mut publisher = BusPublisher::connect(bus_addr)
        .await
        .with_context(|| format!("Failed to reach message bus at {bus_addr}"))?;
    let mut rng = StdRng::from_entropy();
    let mut order_uids = Vec::with_capacity(count as usize);

    for n in 0..count {
        if n > 0 && !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
        let order = generate_order(&mut rng);
        publisher.publish(&order.to_json()?).await?;
        info!(order_uid = %order.order_uid, items = order.items.len(), "order published");
        order_uids.push(order.order_uid);
    }
    publisher.close().await?;

    let summary = PublishSummary {
        published: order_uids.len(),
        order_uids,
    };
    output(&summary, json, |s| {
        println!("Published {} orders to {bus_addr}", s.published);
        for uid in &s.order_uids {
            println!("  {uid}");
        }
    })
}

/// Print one order straight from the store.
pub fn cmd_show(db: &Path, order_uid: &str, json: bool) -> Result<()> {
    let store = open_store(db)?;
    let order = store
        .load_order(order_uid)?
        .with_context(|| format!("order {order_uid} not found"))?;

    output(&order, json, |o| {
        println!("{}  track {}  {}", o.order_uid, o.track_number, o.date_created);
        println!(
            "  customer {}  via {}  locale {}",
            o.customer_id, o.delivery_service, o.locale
        );
        println!(
            "  deliver to {}, {}, {} {}",
            o.delivery.name, o.delivery.address, o.delivery.city, o.delivery.zip
        );
        println!(
            "  paid {} {} ({} goods + {} delivery) via {}",
            o.payment.amount,
            o.payment.currency,
            o.payment.goods_total,
            o.payment.delivery_cost,
            o.payment.provider
        );
        if o.items.is_empty() {
            println!("  no items");
        }
        for item in &o.items {
            println!(
                "  item {}  {} {}  {}  status {}",
                item.chrt_id, item.brand, item.name, item.total_price, item.status
            );
        }
    })
}

/// Row counts of the order store.
pub fn cmd_stats(db: &Path, json: bool) -> Result<()> {
    let store = open_store(db)?;
    let stats = store.stats()?;

    output(&stats, json, |s| {
        println!("Orders:     {}", s.orders);
        println!("Items:      {}", s.items);
        println!("Deliveries: {}", s.deliveries);
        println!("Payments:   {}", s.payments);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Order;

    #[test]
    fn test_show_unknown_order_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = cmd_show(&dir.path().join("orders.db"), "ghost", true).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_show_and_stats_on_stored_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("orders.db");
        {
            let store = open_store(&db).unwrap();
            let order = Order {
                order_uid: "shown".to_string(),
                ..Order::default()
            };
            store.save_order(&order, None, None, &[]).unwrap();
        }
        cmd_show(&db, "shown", false).unwrap();
        cmd_stats(&db, true).unwrap();
    }

    #[tokio::test]
    async fn test_publish_fails_without_bus() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(cmd_publish(&addr.to_string(), 1, Duration::ZERO, true)
            .await
            .is_err());
    }
}
