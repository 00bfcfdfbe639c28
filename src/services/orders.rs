use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use std::sync::Arc;
use tracing::{error, info, instrument};

use crate::entities::order::{
    ActiveModel as OrderActiveModel, DeliveryResults, DeliveryStatus, Entity as OrderEntity,
    LineItem, LineItems, Model as OrderModel, OrderStatus,
};
use crate::errors::{is_unique_violation, ServiceError};

/// Fields of an order created from a successful payment.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub id: String,
    pub user_id: Option<String>,
    pub user_email: Option<String>,
    pub items: Vec<LineItem>,
    pub total: Decimal,
    pub currency: String,
    pub payment_id: Option<String>,
    pub payment_method: Option<String>,
    pub provider: Option<String>,
    pub delivery_status: DeliveryStatus,
}

/// Order Store. Orders are keyed by the internal order id and never deleted.
#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DatabaseConnection>,
}

impl OrderService {
    pub fn new(db_pool: Arc<DatabaseConnection>) -> Self {
        Self { db_pool }
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: &str) -> Result<Option<OrderModel>, ServiceError> {
        OrderEntity::find_by_id(order_id.to_string())
            .one(self.db_pool.as_ref())
            .await
            .map_err(|e| {
                error!(error = %e, order_id, "Failed to fetch order from database");
                ServiceError::DatabaseError(e)
            })
    }

    pub async fn require_order(&self, order_id: &str) -> Result<OrderModel, ServiceError> {
        self.get_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order {order_id} not found")))
    }

    /// Inserts the order unless it exists. A concurrent insert of the same id
    /// loses on the primary key and re-reads the winner.
    ///
    /// Returns the stored order and whether this call created it.
    #[instrument(skip(self, new), fields(order_id = %new.id))]
    pub async fn create_if_absent(&self, new: NewOrder) -> Result<(OrderModel, bool), ServiceError> {
        if let Some(existing) = self.get_order(&new.id).await? {
            return Ok((existing, false));
        }

        let now = Utc::now();
        let order_id = new.id.clone();
        let model = OrderActiveModel {
            id: Set(new.id),
            user_id: Set(new.user_id),
            user_email: Set(new.user_email),
            items: Set(LineItems(new.items)),
            total: Set(new.total),
            currency: Set(new.currency.to_ascii_uppercase()),
            status: Set(OrderStatus::Pending.to_string()),
            payment_id: Set(new.payment_id),
            payment_method: Set(new.payment_method),
            provider: Set(new.provider),
            delivery_status: Set(new.delivery_status.to_string()),
            delivery_results: Set(DeliveryResults::default()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match model.insert(self.db_pool.as_ref()).await {
            Ok(created) => {
                info!(order_id = %created.id, total = %created.total, "Order created");
                Ok((created, true))
            }
            Err(e) if is_unique_violation(&e) => {
                info!(%order_id, "Order created concurrently, using stored row");
                Ok((self.require_order(&order_id).await?, false))
            }
            Err(e) => {
                error!(error = %e, %order_id, "Failed to create order");
                Err(e.into())
            }
        }
    }

    /// Single write after delivery: results, their aggregate status, and the
    /// order marked completed.
    #[instrument(skip(self, order, results), fields(order_id = %order.id))]
    pub async fn record_delivery(
        &self,
        order: OrderModel,
        delivery_status: DeliveryStatus,
        results: DeliveryResults,
    ) -> Result<OrderModel, ServiceError> {
        let mut model: OrderActiveModel = order.into();
        model.status = Set(OrderStatus::Completed.to_string());
        model.delivery_status = Set(delivery_status.to_string());
        model.delivery_results = Set(results);
        model.updated_at = Set(Utc::now());
        Ok(model.update(self.db_pool.as_ref()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::order::DeliveryResult;
    use rust_decimal_macros::dec;

    async fn service() -> OrderService {
        let db = crate::db::establish_connection("sqlite::memory:").await.unwrap();
        crate::db::run_migrations(&db).await.unwrap();
        OrderService::new(Arc::new(db))
    }

    fn new_order(id: &str) -> NewOrder {
        NewOrder {
            id: id.into(),
            user_id: Some("u1".into()),
            user_email: Some("buyer@example.com".into()),
            items: vec![LineItem {
                item_id: "agent-1".into(),
                title: "Agent".into(),
                unit_price: dec!(10),
            }],
            total: dec!(10),
            currency: "eur".into(),
            payment_id: Some("cap_1".into()),
            payment_method: Some("card".into()),
            provider: Some("gateway".into()),
            delivery_status: DeliveryStatus::Pending,
        }
    }

    #[tokio::test]
    async fn second_create_returns_existing_order() {
        let svc = service().await;
        let (first, created) = svc.create_if_absent(new_order("ord_1")).await.unwrap();
        assert!(created);
        assert_eq!(first.currency, "EUR");

        let mut other = new_order("ord_1");
        other.total = dec!(99);
        let (second, created) = svc.create_if_absent(other).await.unwrap();
        assert!(!created);
        assert_eq!(second.total.round_dp(2), dec!(10));
    }

    #[tokio::test]
    async fn record_delivery_completes_order() {
        let svc = service().await;
        let (order, _) = svc.create_if_absent(new_order("ord_2")).await.unwrap();
        let results = DeliveryResults(vec![DeliveryResult::delivered("agent-1", "m-1")]);
        let updated = svc
            .record_delivery(order, DeliveryStatus::Completed, results.clone())
            .await
            .unwrap();

        assert_eq!(updated.status, "completed");
        assert_eq!(updated.delivery_status(), DeliveryStatus::Completed);
        assert_eq!(svc.require_order("ord_2").await.unwrap().delivery_results, results);
        assert!(matches!(
            svc.require_order("missing").await,
            Err(ServiceError::NotFound(_))
        ));
    }
}
