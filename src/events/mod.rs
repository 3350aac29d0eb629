use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Domain events emitted by the core after a successful commit.
///
/// Emission is fire-and-forget: the transaction that produced the event has
/// already committed, so a full channel or closed receiver is logged and
/// dropped, never propagated into the operation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    MovementRecorded {
        movement_id: i64,
        material_id: i64,
        location_id: i64,
        kind: String,
        quantity: Decimal,
        balance: Decimal,
    },
    MovementAmended {
        movement_id: i64,
        material_id: i64,
        location_id: i64,
        balance: Decimal,
    },
    MovementRetracted {
        movement_id: i64,
        material_id: i64,
        location_id: i64,
        balance: Decimal,
    },
    /// A negative write left the balance at or below its reorder minimum.
    LowStockDetected {
        material_id: i64,
        location_id: i64,
        quantity: Decimal,
        reorder_minimum: Decimal,
    },
    ProductionOrderExecuted {
        order_id: i64,
        product_id: i64,
        batch_id: i64,
        batch_code: String,
        quantity: Decimal,
    },
    BatchCreated {
        batch_id: i64,
        product_id: i64,
        location_id: i64,
        code: String,
        expiry_date: NaiveDate,
        initial_quantity: Decimal,
    },
    SalesOrderConfirmed {
        order_id: i64,
        warehouse_id: i64,
        consumption_count: usize,
    },
    WarehouseCreated {
        warehouse_id: i64,
        tenant_id: i64,
    },
    LocationCreated {
        location_id: i64,
        warehouse_id: i64,
    },
    Generic {
        message: String,
        timestamp: DateTime<Utc>,
        metadata: serde_json::Value,
    },
}

impl Event {
    /// Create a generic event with string data
    pub fn with_data(data: String) -> Self {
        Event::Generic {
            message: data,
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event, surfacing the failure to the caller.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is gone.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("event dropped: {}", e);
        }
    }
}

/// Handlers implementing this trait process events asynchronously.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: Event) -> Result<(), String>;
}

/// Drains the event channel, fanning each event out to the handlers.
///
/// Spawn this once next to the service bundle:
/// `tokio::spawn(process_events(rx, handlers))`.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, handlers: Vec<Box<dyn EventHandler>>) {
    info!("starting event processing loop");

    while let Some(event) = rx.recv().await {
        info!("received event: {:?}", event);

        for handler in &handlers {
            if let Err(e) = handler.handle_event(event.clone()).await {
                warn!("event handler failed: {}", e);
            }
        }
    }

    info!("event channel closed, stopping event processing loop");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl EventHandler for Counter {
        async fn handle_event(&self, _event: Event) -> Result<(), String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn events_reach_every_handler() {
        let seen = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(process_events(
            rx,
            vec![
                Box::new(Counter(seen.clone())) as Box<dyn EventHandler>,
                Box::new(Counter(seen.clone())),
            ],
        ));

        let sender = EventSender::new(tx);
        sender.send_or_log(Event::with_data("hello".into())).await;
        sender
            .send_or_log(Event::LowStockDetected {
                material_id: 1,
                location_id: 2,
                quantity: Decimal::ZERO,
                reorder_minimum: Decimal::ONE,
            })
            .await;
        drop(sender);

        task.await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }
}
