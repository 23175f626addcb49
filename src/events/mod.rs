use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::models::StockKey;

/// Committed stock movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockEvent {
    Incremented {
        key: StockKey,
        amount: i64,
        quantity: i64,
        at: DateTime<Utc>,
    },
    Decremented {
        key: StockKey,
        amount: i64,
        quantity: i64,
        at: DateTime<Utc>,
    },
    Transferred {
        source: StockKey,
        destination: StockKey,
        amount: i64,
        at: DateTime<Utc>,
    },
}

impl StockEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StockEvent::Incremented { .. } => "stock.incremented",
            StockEvent::Decremented { .. } => "stock.decremented",
            StockEvent::Transferred { .. } => "stock.transferred",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<StockEvent>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<StockEvent>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: StockEvent) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is closed.
    pub async fn send_or_log(&self, event: StockEvent) {
        let name = event.name();
        if let Err(error) = self.send(event).await {
            warn!(event = name, %error, "dropping stock event");
        }
    }
}

/// Bounded event channel.
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<StockEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

/// Drains the channel, writing every movement to the audit log.
pub async fn process_events(mut rx: mpsc::Receiver<StockEvent>) {
    info!("Starting stock event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            StockEvent::Incremented {
                key,
                amount,
                quantity,
                ..
            }
            | StockEvent::Decremented {
                key,
                amount,
                quantity,
                ..
            } => {
                info!(
                    event = event.name(),
                    lot_id = key.lot_id,
                    warehouse = %key.warehouse_type,
                    warehouse_id = key.warehouse_id,
                    amount = *amount,
                    quantity = *quantity,
                    "stock movement"
                );
            }
            StockEvent::Transferred {
                source,
                destination,
                amount,
                ..
            } => {
                info!(
                    event = event.name(),
                    lot_id = source.lot_id,
                    source = %source,
                    destination = %destination,
                    amount = *amount,
                    "stock movement"
                );
            }
        }
    }

    info!("Stock event channel closed");
}

/// Waits for a spawned [`process_events`] task after its senders are gone.
///
/// Returns `false` when the task panicked or was cancelled.
pub async fn join_processor(handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "event processor did not shut down cleanly");
            false
        }
    }
}
