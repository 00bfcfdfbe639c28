use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::config::DeliveryConfig;
use crate::entities::template_access_token::{ActiveModel, Column, Entity as AccessToken, Model};
use crate::errors::ServiceError;

/// Result of checking a presented token against a download request.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenCheck {
    Valid(Model),
    NotFound,
    Expired { expired_at: DateTime<Utc> },
    Revoked { reason: Option<String> },
    /// Token exists but belongs to another order or agent.
    Mismatch,
}

/// Mints and validates capabilities for purchased template content.
#[derive(Clone)]
pub struct TemplateAccessService {
    db: Arc<DatabaseConnection>,
    ttl: Duration,
    public_base_url: String,
}

/// 256 random bits, URL-safe without padding.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

impl TemplateAccessService {
    pub fn new(db: Arc<DatabaseConnection>, delivery: &DeliveryConfig) -> Self {
        Self {
            db,
            ttl: Duration::days(delivery.token_ttl_days),
            public_base_url: delivery.public_base_url.trim_end_matches('/').to_string(),
        }
    }

    #[instrument(skip(self, email))]
    pub async fn mint(
        &self,
        order_id: &str,
        agent_id: &str,
        user_id: Option<&str>,
        email: &str,
    ) -> Result<Model, ServiceError> {
        let now = Utc::now();
        let model = ActiveModel {
            token: Set(generate_token()),
            order_id: Set(order_id.to_string()),
            agent_id: Set(agent_id.to_string()),
            user_id: Set(user_id.map(str::to_string)),
            email: Set(email.to_string()),
            created_at: Set(now),
            expires_at: Set(now + self.ttl),
            use_count: Set(0),
            last_used_at: Set(None),
            revoked: Set(false),
            revoked_reason: Set(None),
            revoked_at: Set(None),
        };
        Ok(model.insert(self.db.as_ref()).await?)
    }

    pub fn download_url(&self, agent_id: &str, order_id: &str, token: &str) -> String {
        let mut url = match url::Url::parse(&format!(
            "{}/api/v1/templates/download/{}",
            self.public_base_url, agent_id
        )) {
            Ok(url) => url,
            Err(_) => {
                return format!(
                    "{}/api/v1/templates/download/{}?orderId={}&token={}",
                    self.public_base_url, agent_id, order_id, token
                )
            }
        };
        url.query_pairs_mut()
            .append_pair("orderId", order_id)
            .append_pair("token", token);
        url.to_string()
    }

    /// Usable iff not revoked, not expired and issued for this order and agent.
    pub async fn check(
        &self,
        token: &str,
        order_id: &str,
        agent_id: &str,
    ) -> Result<TokenCheck, ServiceError> {
        let Some(record) = AccessToken::find_by_id(token.to_string())
            .one(self.db.as_ref())
            .await?
        else {
            return Ok(TokenCheck::NotFound);
        };

        if record.revoked {
            return Ok(TokenCheck::Revoked {
                reason: record.revoked_reason,
            });
        }
        if Utc::now() >= record.expires_at {
            return Ok(TokenCheck::Expired {
                expired_at: record.expires_at,
            });
        }
        if record.order_id != order_id || record.agent_id != agent_id {
            warn!(order_id, agent_id, "access token presented for a different purchase");
            return Ok(TokenCheck::Mismatch);
        }
        Ok(TokenCheck::Valid(record))
    }

    /// Counts a successful download.
    pub async fn record_use(&self, token: &str) -> Result<(), ServiceError> {
        AccessToken::update_many()
            .col_expr(Column::UseCount, Expr::col(Column::UseCount).add(1))
            .col_expr(Column::LastUsedAt, Expr::value(Some(Utc::now())))
            .filter(Column::Token.eq(token))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    pub async fn revoke(&self, token: &str, reason: &str) -> Result<Model, ServiceError> {
        let record = AccessToken::find_by_id(token.to_string())
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound("access token not found".into()))?;
        if record.revoked {
            return Ok(record);
        }

        let mut active: ActiveModel = record.into();
        active.revoked = Set(true);
        active.revoked_reason = Set(Some(reason.to_string()));
        active.revoked_at = Set(Some(Utc::now()));
        let updated = active.update(self.db.as_ref()).await?;
        info!(order_id = %updated.order_id, agent_id = %updated.agent_id, reason, "access token revoked");
        Ok(updated)
    }

    /// Revokes every live token of an order. Returns how many were revoked.
    pub async fn revoke_for_order(&self, order_id: &str, reason: &str) -> Result<u64, ServiceError> {
        let result = AccessToken::update_many()
            .col_expr(Column::Revoked, Expr::value(true))
            .col_expr(Column::RevokedReason, Expr::value(Some(reason.to_string())))
            .col_expr(Column::RevokedAt, Expr::value(Some(Utc::now())))
            .filter(Column::OrderId.eq(order_id))
            .filter(Column::Revoked.eq(false))
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected)
    }

    pub async fn list_for_order(&self, order_id: &str) -> Result<Vec<Model>, ServiceError> {
        Ok(AccessToken::find()
            .filter(Column::OrderId.eq(order_id))
            .all(self.db.as_ref())
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection, run_migrations};
    use assert_matches::assert_matches;

    async fn service() -> TemplateAccessService {
        let db = establish_connection("sqlite::memory:").await.unwrap();
        run_migrations(&db).await.unwrap();
        TemplateAccessService::new(
            Arc::new(db),
            &DeliveryConfig {
                token_ttl_days: 30,
                public_base_url: "https://agents.market/".into(),
            },
        )
    }

    #[test]
    fn tokens_are_url_safe_and_unique() {
        let a = generate_token();
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(a, generate_token());
    }

    #[tokio::test]
    async fn minted_token_lives_thirty_days() {
        let svc = service().await;
        let token = svc.mint("ord_1", "agent-1", None, "b@example.com").await.unwrap();
        let ttl = token.expires_at - token.created_at;
        assert_eq!(ttl.num_days(), 30);

        assert_matches!(svc.check(&token.token, "ord_1", "agent-1").await.unwrap(), TokenCheck::Valid(_));
        assert_matches!(svc.check(&token.token, "ord_1", "agent-2").await.unwrap(), TokenCheck::Mismatch);
        assert_matches!(svc.check("nope", "ord_1", "agent-1").await.unwrap(), TokenCheck::NotFound);
    }

    #[tokio::test]
    async fn use_count_increments_and_revocation_sticks() {
        let svc = service().await;
        let token = svc.mint("ord_1", "agent-1", Some("u1"), "b@example.com").await.unwrap();
        svc.record_use(&token.token).await.unwrap();
        svc.record_use(&token.token).await.unwrap();

        let tokens = svc.list_for_order("ord_1").await.unwrap();
        assert_eq!(tokens[0].use_count, 2);
        assert!(tokens[0].last_used_at.is_some());

        assert_eq!(svc.revoke_for_order("ord_1", "refunded").await.unwrap(), 1);
        assert_eq!(svc.revoke_for_order("ord_1", "refunded").await.unwrap(), 0);
        assert_matches!(
            svc.check(&token.token, "ord_1", "agent-1").await.unwrap(),
            TokenCheck::Revoked { reason: Some(r) } if r == "refunded"
        );
    }

    #[test]
    fn download_url_escapes_query() {
        let db = sea_orm::DatabaseConnection::Disconnected;
        let svc = TemplateAccessService::new(Arc::new(db), &DeliveryConfig::default());
        let url = svc.download_url("agent 1", "ord_1", "abc-_");
        assert!(url.starts_with("http://localhost:8080/api/v1/templates/download/agent%201?"));
        assert!(url.ends_with("orderId=ord_1&token=abc-_"));
    }
}
