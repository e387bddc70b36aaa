//! Order Materializer - order bus consumer
//!
//! Turns `order_events` records into durable PendingPayment orders.
//! Batches up to B messages or T ms, commits the batch in a single
//! durable transaction, and only then commits bus offsets. A failed
//! batch is never committed; the bus redelivers and the idempotent
//! inserts make the retry safe.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::error::FlashSaleError;
use super::repository::OrderRepository;
use super::types::{Order, OrderEvent, OrderStatus, StockLog, StockOp};
use crate::bus::BusConsumer;
use crate::config::OrderConfig;
use crate::store::{FastStore, keys};

pub struct OrderMaterializer {
    consumer: Arc<dyn BusConsumer>,
    orders: Arc<dyn OrderRepository>,
    store: Arc<dyn FastStore>,
    config: OrderConfig,
}

impl OrderMaterializer {
    pub fn new(
        consumer: Arc<dyn BusConsumer>,
        orders: Arc<dyn OrderRepository>,
        store: Arc<dyn FastStore>,
        config: OrderConfig,
    ) -> Self {
        Self {
            consumer,
            orders,
            store,
            config,
        }
    }

    /// Run the consume loop forever.
    pub async fn run(&self) -> ! {
        info!(
            batch_size = self.config.batch_size,
            batch_timeout_ms = self.config.batch_timeout_ms,
            "Starting order materializer"
        );
        loop {
            match self.process_once().await {
                Ok(0) => {}
                Ok(n) => debug!(orders = n, "Materialized batch"),
                Err(e) => {
                    // Offsets were not committed; the batch redelivers
                    error!(error = %e, "Materializer batch failed, awaiting redelivery");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// One poll-insert-commit cycle. Returns the number of orders
    /// newly materialized.
    pub async fn process_once(&self) -> Result<u64, FlashSaleError> {
        let records = self
            .consumer
            .poll_batch(
                self.config.batch_size,
                Duration::from_millis(self.config.batch_timeout_ms),
            )
            .await?;
        if records.is_empty() {
            return Ok(0);
        }

        let mut batch = Vec::with_capacity(records.len());
        for record in &records {
            match serde_json::from_slice::<OrderEvent>(&record.payload) {
                Ok(event) => batch.push(event_to_rows(event)),
                // A malformed record would redeliver forever; log it
                // and move past.
                Err(e) => warn!(
                    offset = record.offset,
                    partition = record.partition,
                    error = %e,
                    "Skipping malformed order event"
                ),
            }
        }

        let inserted = self.orders.materialize(&batch).await?;

        for (order, _) in &batch {
            if let Err(e) = self
                .store
                .cache_put(
                    &keys::order_status(&order.order_id.to_string()),
                    order.status.as_str(),
                    self.config.order_status_ttl_secs,
                )
                .await
            {
                warn!(order_id = %order.order_id, error = %e, "Status cache write failed");
            }
        }

        self.consumer.commit().await?;
        Ok(inserted)
    }
}

fn event_to_rows(event: OrderEvent) -> (Order, StockLog) {
    let order = Order {
        order_id: event.order_id,
        user_id: event.user_id,
        sku_id: event.sku_id,
        activity_id: event.activity_id,
        qty: event.qty,
        status: OrderStatus::PendingPayment,
        created_at: event.ts,
        paid_at: None,
        cancelled_at: None,
    };
    let log = StockLog {
        sku_id: event.sku_id,
        order_id: event.order_id,
        op: StockOp::Deduct,
        qty: event.qty,
        stock_before: event.remaining_after as i64 + event.qty as i64,
        stock_after: event.remaining_after as i64,
    };
    (order, log)
}
