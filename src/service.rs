//! Cache-aside access layer: the message-driven write path and the
//! lookup-driven read path around one shared [`ExpiringCache`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::cache::{ExpiringCache, SetOutcome};
use crate::error::{PersistStep, ServiceError};
use crate::store::OrderStore;
use crate::types::{Lookup, Order, ServedFrom};

/// Configuration of the access paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// TTL for entries created by ingestion, lookups and warm-up.
    /// Independent of the cache's default TTL.
    pub entry_ttl: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            entry_ttl: Duration::from_secs(5 * 60),
        }
    }
}

/// Result of one persistence step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub step: PersistStep,
    pub result: Result<(), ServiceError>,
}

/// What happened to one inbound message.
///
/// Persistence steps are independent: a failure is recorded and the next
/// step still runs, so a report can describe a partially stored order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub order_uid: String,
    pub cached: SetOutcome,
    pub steps: Vec<StepOutcome>,
}

impl IngestReport {
    /// True when every persistence step succeeded.
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.result.is_ok())
    }

    pub fn failed_steps(&self) -> Vec<PersistStep> {
        self.steps
            .iter()
            .filter(|s| s.result.is_err())
            .map(|s| s.step)
            .collect()
    }
}

/// Ingestion handler and query path sharing one cache and one durable store.
pub struct OrderService<S> {
    cache: Arc<ExpiringCache<Order>>,
    store: Arc<S>,
    config: ServiceConfig,
}

impl<S> std::fmt::Debug for OrderService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderService")
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: OrderStore> OrderService<S> {
    pub fn new(cache: Arc<ExpiringCache<Order>>, store: Arc<S>, config: ServiceConfig) -> Self {
        Self {
            cache,
            store,
            config,
        }
    }

    pub fn cache(&self) -> &ExpiringCache<Order> {
        &self.cache
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    // ── Write path ──

    /// Decode one bus payload, cache it, then persist it step by step.
    ///
    /// Decode failures and empty order ids drop the message: nothing is
    /// cached or stored. The message is never retried either way.
    pub fn handle_message(&self, payload: &[u8]) -> Result<IngestReport, ServiceError> {
        let order = match Order::from_json(payload) {
            Ok(order) => order,
            Err(e) => {
                warn!(error = %e, bytes = payload.len(), "dropping undecodable message");
                return Err(ServiceError::Decode {
                    reason: e.to_string(),
                });
            }
        };

        if order.order_uid.is_empty() {
            warn!("dropping message without order_uid");
            return Err(ServiceError::MissingOrderUid);
        }

        let cached = self
            .cache
            .set(order.order_uid.clone(), order.clone(), self.config.entry_ttl);
        match cached {
            SetOutcome::Stored => info!(order_uid = %order.order_uid, "order cached"),
            SetOutcome::Rejected => {
                debug!(order_uid = %order.order_uid, "order already cached, cache step skipped")
            }
        }

        let steps = self.persist(&order);
        let item_count = order.items.len();
        let report = IngestReport {
            order_uid: order.order_uid,
            cached,
            steps,
        };
        if report.is_complete() {
            info!(order_uid = %report.order_uid, items = item_count, "order persisted");
        } else {
            warn!(
                order_uid = %report.order_uid,
                failed = ?report.failed_steps(),
                "order partially persisted"
            );
        }
        Ok(report)
    }

    /// Delivery, payment, order row, then each item. No rollback.
    fn persist(&self, order: &Order) -> Vec<StepOutcome> {
        let mut steps = Vec::with_capacity(3 + order.items.len());

        let delivery_id = record(
            &mut steps,
            PersistStep::Delivery,
            self.store.save_delivery(&order.delivery),
        );
        let payment_id = record(
            &mut steps,
            PersistStep::Payment,
            self.store.save_payment(&order.payment),
        );
        record(
            &mut steps,
            PersistStep::Order,
            self.store
                .save_order(order, delivery_id, payment_id, &order.item_ids()),
        );
        for (index, item) in order.items.iter().enumerate() {
            record(
                &mut steps,
                PersistStep::Item(index),
                self.store.save_item(item, &order.order_uid),
            );
        }

        steps
    }

    // ── Read path ──

    /// Look up an order, preferring the cache.
    ///
    /// On a miss the aggregate is loaded from the durable store and cached
    /// with the entry TTL. Concurrent misses may each hit the store; the
    /// first cache write wins. Unknown orders are [`ServiceError::NotFound`]
    /// and leave the cache untouched.
    pub fn get_order(&self, order_uid: &str) -> Result<Lookup, ServiceError> {
        if order_uid.is_empty() {
            return Err(ServiceError::MissingOrderUid);
        }

        if let Some(order) = self.cache.get(order_uid) {
            debug!(order_uid, "served from cache");
            return Ok(Lookup {
                served_from: ServedFrom::Cache,
                order,
            });
        }

        let order = match self.store.load_order(order_uid) {
            Ok(Some(order)) => order,
            Ok(None) => {
                debug!(order_uid, "order not found in store");
                return Err(ServiceError::NotFound {
                    order_uid: order_uid.to_string(),
                });
            }
            Err(e) => {
                let reason = format!("{e:#}");
                warn!(order_uid, error = %reason, "loading order failed");
                return Err(ServiceError::Load {
                    order_uid: order_uid.to_string(),
                    reason,
                });
            }
        };

        self.cache
            .set(order_uid, order.clone(), self.config.entry_ttl);
        debug!(order_uid, "served from store");
        Ok(Lookup {
            served_from: ServedFrom::Store,
            order,
        })
    }

    // ── Warm-up ──

    /// Preload the first half of the stored orders into the cache.
    ///
    /// Orders that fail to load are skipped. Returns how many entries were
    /// newly cached.
    pub fn warm_up(&self) -> Result<usize> {
        let total = self
            .store
            .count_orders()
            .context("failed to count stored orders")?;
        let ids = self
            .store
            .order_ids((total / 2) as usize)
            .context("failed to list stored orders")?;

        let mut cached = 0;
        for order_uid in &ids {
            match self.store.load_order(order_uid) {
                Ok(Some(order)) => {
                    if self
                        .cache
                        .set(order_uid.as_str(), order, self.config.entry_ttl)
                        .is_stored()
                    {
                        cached += 1;
                    }
                }
                Ok(None) => debug!(order_uid = %order_uid, "order vanished during warm-up"),
                Err(e) => warn!(order_uid = %order_uid, error = %e, "warm-up load failed"),
            }
        }

        info!(cached, total, "cache warm-up complete");
        Ok(cached)
    }
}

/// Append the outcome of one step, returning the id on success.
fn record<T: std::fmt::Display>(
    steps: &mut Vec<StepOutcome>,
    step: PersistStep,
    result: Result<T>,
) -> Option<T> {
    match result {
        Ok(id) => {
            debug!(%step, %id, "persisted");
            steps.push(StepOutcome {
                step,
                result: Ok(()),
            });
            Some(id)
        }
        Err(e) => {
            let reason = format!("{e:#}");
            warn!(%step, error = %reason, "persist step failed");
            steps.push(StepOutcome {
                step,
                result: Err(ServiceError::Persist { step, reason }),
            });
            None
        }
    }
}
