use async_trait::async_trait;
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entities::order::DeliveryStatus;

pub mod outbox;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Post-commit facts produced by the payment pipeline.
///
/// Events are persisted to the outbox first and dispatched to
/// [`process_events`] by the outbox worker, so every variant must survive a
/// JSON round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: String,
        provider: String,
    },
    OrderDelivered {
        order_id: String,
        delivery_status: DeliveryStatus,
        delivered: usize,
        failed: usize,
    },
    PaymentSucceeded {
        provider: String,
        session_id: String,
        order_id: String,
    },
    PaymentFailed {
        provider: String,
        session_id: String,
        status: String,
    },
    PaymentRefunded {
        provider: String,
        session_id: String,
        order_id: String,
        amount: Decimal,
        currency: String,
    },
    /// A provider reported a terminal status that conflicts with the one already stored.
    SessionAnomaly {
        provider: String,
        session_id: String,
        current_status: String,
        attempted_status: String,
    },
    InvoiceCreated {
        invoice_id: Uuid,
        invoice_number: String,
        order_id: String,
    },
    TokensRevoked {
        order_id: String,
        count: u64,
        reason: String,
    },
    WebhookProcessingFailed {
        provider: String,
        event_id: Option<String>,
        session_id: Option<String>,
        error: String,
    },
}

impl Event {
    /// Stable name stored in `outbox_events.event_type`.
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "OrderCreated",
            Event::OrderDelivered { .. } => "OrderDelivered",
            Event::PaymentSucceeded { .. } => "PaymentSucceeded",
            Event::PaymentFailed { .. } => "PaymentFailed",
            Event::PaymentRefunded { .. } => "PaymentRefunded",
            Event::SessionAnomaly { .. } => "SessionAnomaly",
            Event::InvoiceCreated { .. } => "InvoiceCreated",
            Event::TokensRevoked { .. } => "TokensRevoked",
            Event::WebhookProcessingFailed { .. } => "WebhookProcessingFailed",
        }
    }

    pub fn aggregate_id(&self) -> Option<String> {
        match self {
            Event::OrderCreated { order_id, .. }
            | Event::OrderDelivered { order_id, .. }
            | Event::PaymentRefunded { order_id, .. }
            | Event::InvoiceCreated { order_id, .. }
            | Event::TokensRevoked { order_id, .. }
            | Event::PaymentSucceeded { order_id, .. } => Some(order_id.clone()),
            Event::PaymentFailed { session_id, .. } | Event::SessionAnomaly { session_id, .. } => {
                Some(session_id.clone())
            }
            Event::WebhookProcessingFailed { session_id, .. } => session_id.clone(),
        }
    }
}

/// Handlers implementing this trait process dispatched events asynchronously.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &Event) -> Result<(), String>;
}

/// Default handler: structured logs plus counters.
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle_event(&self, event: &Event) -> Result<(), String> {
        counter!("marketplace.events.dispatched", 1, "type" => event.name());
        match event {
            Event::OrderCreated { order_id, provider } => {
                info!(order_id = %order_id, provider = %provider, "order created");
            }
            Event::OrderDelivered {
                order_id,
                delivery_status,
                delivered,
                failed,
            } => match delivery_status {
                DeliveryStatus::Partial | DeliveryStatus::Failed => warn!(
                    order_id = %order_id,
                    status = %delivery_status,
                    delivered,
                    failed,
                    "template delivery incomplete"
                ),
                _ => info!(order_id = %order_id, status = %delivery_status, "template delivery finished"),
            },
            Event::PaymentSucceeded {
                provider,
                session_id,
                order_id,
            } => {
                info!(provider = %provider, session_id = %session_id, order_id = %order_id, "payment succeeded");
            }
            Event::PaymentFailed {
                provider,
                session_id,
                status,
            } => {
                warn!(provider = %provider, session_id = %session_id, status = %status, "payment did not succeed");
            }
            Event::PaymentRefunded {
                provider,
                session_id,
                amount,
                currency,
                ..
            } => {
                info!(provider = %provider, session_id = %session_id, amount = %amount, currency = %currency, "payment refunded");
            }
            Event::SessionAnomaly {
                provider,
                session_id,
                current_status,
                attempted_status,
            } => {
                warn!(
                    provider = %provider,
                    session_id = %session_id,
                    current = %current_status,
                    attempted = %attempted_status,
                    "conflicting terminal status reported by provider"
                );
            }
            Event::InvoiceCreated {
                invoice_number,
                order_id,
                ..
            } => {
                info!(invoice_number = %invoice_number, order_id = %order_id, "invoice issued");
            }
            Event::TokensRevoked {
                order_id,
                count,
                reason,
            } => {
                info!(order_id = %order_id, count, reason = %reason, "access tokens revoked");
            }
            Event::WebhookProcessingFailed {
                provider,
                event_id,
                session_id,
                error,
            } => {
                error!(
                    provider = %provider,
                    event_id = ?event_id,
                    session_id = ?session_id,
                    error = %error,
                    "webhook processing failed after acknowledgement"
                );
            }
        }
        Ok(())
    }
}

/// Drains the in-process channel and fans each event out to the handlers.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, handlers: Vec<Box<dyn EventHandler>>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        for handler in &handlers {
            if let Err(e) = handler.handle_event(&event).await {
                error!(event = event.name(), error = %e, "event handler failed");
            }
        }
    }

    warn!("Event processing loop has ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn events_survive_json_round_trip() {
        let event = Event::PaymentRefunded {
            provider: "gateway".into(),
            session_id: "gw_123".into(),
            order_id: "ord_1".into(),
            amount: dec!(19.99),
            currency: "EUR".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.aggregate_id().as_deref(), Some("ord_1"));
    }

    #[tokio::test]
    async fn process_events_runs_every_handler() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct Counting(Arc<AtomicUsize>);

        #[async_trait]
        impl EventHandler for Counting {
            async fn handle_event(&self, _event: &Event) -> Result<(), String> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let seen = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        sender
            .send(Event::OrderCreated {
                order_id: "ord_1".into(),
                provider: "paypal".into(),
            })
            .await
            .unwrap();
        drop(sender);

        process_events(
            rx,
            vec![Box::new(LoggingEventHandler), Box::new(Counting(seen.clone()))],
        )
        .await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
