use crate::entities::outbox_event::{self, Entity as OutboxEvent};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const MAX_ATTEMPTS: i32 = 8;
const BASE_BACKOFF_SECS: i64 = 2;
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Delivered => "delivered",
            OutboxStatus::Failed => "failed",
        }
    }
}

/// Persists an event for post-commit dispatch.
pub async fn enqueue(db: &impl ConnectionTrait, event: &Event) -> Result<Uuid, ServiceError> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    let payload = serde_json::to_value(event)?;

    outbox_event::ActiveModel {
        id: Set(id),
        event_type: Set(event.name().to_string()),
        aggregate_id: Set(event.aggregate_id()),
        payload: Set(payload),
        status: Set(OutboxStatus::Pending.as_str().to_string()),
        attempts: Set(0),
        available_at: Set(now),
        error_message: Set(None),
        created_at: Set(now),
        updated_at: Set(None),
        processed_at: Set(None),
    }
    .insert(db)
    .await?;

    debug!(outbox_id = %id, event_type = event.name(), "enqueued outbox event");
    Ok(id)
}

/// Enqueues without failing the caller. Used after the primary write has
/// already committed, where an outbox error must not undo the response.
pub async fn enqueue_best_effort(db: &impl ConnectionTrait, event: Event) {
    if let Err(e) = enqueue(db, &event).await {
        error!(event_type = event.name(), error = %e, "failed to enqueue outbox event");
    }
}

/// Background worker that polls the outbox and dispatches through the
/// in-process `EventSender`.
pub fn start_worker(db: Arc<DatabaseConnection>, sender: EventSender) -> JoinHandle<()> {
    info!("Starting outbox worker");
    tokio::spawn(async move {
        loop {
            match drain_once(&db, &sender, 50).await {
                Ok(0) => {}
                Ok(n) => debug!(dispatched = n, "outbox batch drained"),
                Err(e) => error!("outbox worker error: {}", e),
            }
            sleep(POLL_INTERVAL).await;
        }
    })
}

/// Claims up to `batch_size` due events and dispatches them. Returns the
/// number handed to the sender.
pub async fn drain_once(
    db: &DatabaseConnection,
    sender: &EventSender,
    batch_size: u64,
) -> Result<usize, ServiceError> {
    let now = Utc::now();
    let due = OutboxEvent::find()
        .filter(outbox_event::Column::Status.eq(OutboxStatus::Pending.as_str()))
        .filter(outbox_event::Column::AvailableAt.lte(now))
        .order_by_asc(outbox_event::Column::CreatedAt)
        .limit(batch_size)
        .all(db)
        .await?;

    let mut dispatched = 0;
    for row in due {
        // Compare-and-set claim so two workers never dispatch the same row.
        let claimed = OutboxEvent::update_many()
            .col_expr(
                outbox_event::Column::Status,
                Expr::value(OutboxStatus::Processing.as_str()),
            )
            .col_expr(outbox_event::Column::Attempts, Expr::value(row.attempts + 1))
            .col_expr(outbox_event::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(outbox_event::Column::Id.eq(row.id))
            .filter(outbox_event::Column::Status.eq(OutboxStatus::Pending.as_str()))
            .exec(db)
            .await?;
        if claimed.rows_affected != 1 {
            continue;
        }
        let attempts = row.attempts + 1;

        let event: Event = match serde_json::from_value(row.payload.clone()) {
            Ok(event) => event,
            Err(e) => {
                warn!(outbox_id = %row.id, event_type = %row.event_type, "undecodable outbox payload");
                mark(db, row.id, OutboxStatus::Failed, Some(format!("decode: {e}")), None).await;
                continue;
            }
        };

        match sender.send(event).await {
            Ok(()) => {
                dispatched += 1;
                mark(db, row.id, OutboxStatus::Delivered, None, None).await;
            }
            Err(e) if attempts < MAX_ATTEMPTS => {
                let retry_at = Utc::now() + retry_delay(attempts);
                mark(db, row.id, OutboxStatus::Pending, Some(e), Some(retry_at)).await;
            }
            Err(_) => {
                mark(
                    db,
                    row.id,
                    OutboxStatus::Failed,
                    Some("max attempts exceeded".to_string()),
                    None,
                )
                .await;
            }
        }
    }
    Ok(dispatched)
}

/// Exponential backoff with up to one second of jitter.
pub fn retry_delay(attempts: i32) -> ChronoDuration {
    let exp = attempts.clamp(0, 16) as u32;
    let jitter_ms = rand::thread_rng().gen_range(0..1000);
    ChronoDuration::seconds(BASE_BACKOFF_SECS.saturating_pow(exp))
        + ChronoDuration::milliseconds(jitter_ms)
}

async fn mark(
    db: &DatabaseConnection,
    id: Uuid,
    status: OutboxStatus,
    error_message: Option<String>,
    available_at: Option<chrono::DateTime<Utc>>,
) {
    let now = Utc::now();
    let mut update = OutboxEvent::update_many()
        .col_expr(outbox_event::Column::Status, Expr::value(status.as_str()))
        .col_expr(outbox_event::Column::ErrorMessage, Expr::value(error_message))
        .col_expr(outbox_event::Column::UpdatedAt, Expr::value(Some(now)));
    if status == OutboxStatus::Delivered {
        update = update.col_expr(outbox_event::Column::ProcessedAt, Expr::value(Some(now)));
    }
    if let Some(at) = available_at {
        update = update.col_expr(outbox_event::Column::AvailableAt, Expr::value(at));
    }
    if let Err(e) = update
        .filter(outbox_event::Column::Id.eq(id))
        .exec(db)
        .await
    {
        warn!("failed updating outbox {}: {}", id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection, run_migrations};
    use tokio::sync::mpsc;

    async fn setup() -> DatabaseConnection {
        let db = establish_connection("sqlite::memory:").await.unwrap();
        run_migrations(&db).await.unwrap();
        db
    }

    fn sample() -> Event {
        Event::OrderCreated {
            order_id: "ord_1".into(),
            provider: "paypal".into(),
        }
    }

    #[test]
    fn retry_delay_grows_exponentially() {
        let first = retry_delay(1);
        let third = retry_delay(3);
        assert!(first >= ChronoDuration::seconds(2) && first < ChronoDuration::seconds(3));
        assert!(third >= ChronoDuration::seconds(8) && third < ChronoDuration::seconds(9));
    }

    #[tokio::test]
    async fn drained_events_reach_the_sender_once() {
        let db = setup().await;
        enqueue(&db, &sample()).await.unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);

        assert_eq!(drain_once(&db, &sender, 10).await.unwrap(), 1);
        assert_eq!(rx.recv().await, Some(sample()));
        assert_eq!(drain_once(&db, &sender, 10).await.unwrap(), 0);

        let row = OutboxEvent::find().one(&db).await.unwrap().unwrap();
        assert_eq!(row.status, "delivered");
        assert_eq!(row.attempts, 1);
        assert!(row.processed_at.is_some());
    }

    #[tokio::test]
    async fn closed_channel_schedules_a_retry() {
        let db = setup().await;
        enqueue(&db, &sample()).await.unwrap();

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);

        assert_eq!(drain_once(&db, &sender, 10).await.unwrap(), 0);
        let row = OutboxEvent::find().one(&db).await.unwrap().unwrap();
        assert_eq!(row.status, "pending");
        assert!(row.available_at > Utc::now());
        assert!(row.error_message.is_some());
    }
}
