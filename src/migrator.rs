use anyhow::Result;
use sea_orm::{ConnectOptions, Database};
use sea_orm_migration::prelude::*;
use std::time::Duration;
use tracing::{error, info};

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240601_000001_create_orders_table::Migration),
            Box::new(m20240601_000002_create_payment_sessions_table::Migration),
            Box::new(m20240601_000003_create_webhook_events_table::Migration),
            Box::new(m20240601_000004_create_template_access_tokens_table::Migration),
            Box::new(m20240601_000005_create_invoices_table::Migration),
            Box::new(m20240601_000006_create_agents_table::Migration),
            Box::new(m20240601_000007_create_outbox_events_table::Migration),
        ]
    }
}

mod m20240601_000001_create_orders_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000001_create_orders_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).string().primary_key().not_null())
                        .col(ColumnDef::new(Orders::UserId).string().null())
                        .col(ColumnDef::new(Orders::UserEmail).string().null())
                        .col(ColumnDef::new(Orders::Items).json().not_null())
                        .col(
                            ColumnDef::new(Orders::Total)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Orders::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Orders::Status).string().not_null())
                        .col(ColumnDef::new(Orders::PaymentId).string().null())
                        .col(ColumnDef::new(Orders::PaymentMethod).string().null())
                        .col(ColumnDef::new(Orders::Provider).string().null())
                        .col(
                            ColumnDef::new(Orders::DeliveryStatus)
                                .string()
                                .not_null()
                                .default("pending"),
                        )
                        .col(ColumnDef::new(Orders::DeliveryResults).json().not_null())
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_user_email")
                        .table(Orders::Table)
                        .col(Orders::UserEmail)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Orders {
        Table,
        Id,
        UserId,
        UserEmail,
        Items,
        Total,
        Currency,
        Status,
        PaymentId,
        PaymentMethod,
        Provider,
        DeliveryStatus,
        DeliveryResults,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000002_create_payment_sessions_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000002_create_payment_sessions_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PaymentSessions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PaymentSessions::ProviderSessionId)
                                .string()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PaymentSessions::Provider).string().not_null())
                        .col(
                            ColumnDef::new(PaymentSessions::InternalOrderId)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentSessions::Amount)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentSessions::Currency)
                                .string_len(3)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentSessions::OriginalAmount)
                                .decimal_len(16, 4)
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PaymentSessions::OriginalCurrency)
                                .string_len(3)
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PaymentSessions::TaxAmount)
                                .decimal_len(16, 4)
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PaymentSessions::TaxRate)
                                .decimal_len(6, 4)
                                .null(),
                        )
                        .col(ColumnDef::new(PaymentSessions::Items).json().not_null())
                        .col(ColumnDef::new(PaymentSessions::CustomerInfo).json().not_null())
                        .col(ColumnDef::new(PaymentSessions::Metadata).json().not_null())
                        .col(ColumnDef::new(PaymentSessions::Status).string().not_null())
                        .col(ColumnDef::new(PaymentSessions::ProviderPaymentId).string().null())
                        .col(ColumnDef::new(PaymentSessions::PaymentUrl).text().null())
                        .col(ColumnDef::new(PaymentSessions::LastProviderStatus).string().null())
                        .col(
                            ColumnDef::new(PaymentSessions::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentSessions::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentSessions::ConfirmedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PaymentSessions::PaidAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PaymentSessions::FailedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PaymentSessions::CancelledAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PaymentSessions::RefundedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payment_sessions_internal_order_id")
                        .table(PaymentSessions::Table)
                        .col(PaymentSessions::InternalOrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PaymentSessions::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum PaymentSessions {
        Table,
        ProviderSessionId,
        Provider,
        InternalOrderId,
        Amount,
        Currency,
        OriginalAmount,
        OriginalCurrency,
        TaxAmount,
        TaxRate,
        Items,
        CustomerInfo,
        Metadata,
        Status,
        ProviderPaymentId,
        PaymentUrl,
        LastProviderStatus,
        CreatedAt,
        UpdatedAt,
        ConfirmedAt,
        PaidAt,
        FailedAt,
        CancelledAt,
        RefundedAt,
    }
}

mod m20240601_000003_create_webhook_events_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000003_create_webhook_events_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(WebhookEvents::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(WebhookEvents::Provider).string().not_null())
                        .col(ColumnDef::new(WebhookEvents::EventId).string().not_null())
                        .col(ColumnDef::new(WebhookEvents::EventType).string().not_null())
                        .col(ColumnDef::new(WebhookEvents::ProviderSessionId).string().null())
                        .col(
                            ColumnDef::new(WebhookEvents::ReceivedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .primary_key(
                            Index::create()
                                .col(WebhookEvents::Provider)
                                .col(WebhookEvents::EventId),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(WebhookEvents::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum WebhookEvents {
        Table,
        Provider,
        EventId,
        EventType,
        ProviderSessionId,
        ReceivedAt,
    }
}

mod m20240601_000004_create_template_access_tokens_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000004_create_template_access_tokens_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(TemplateAccessTokens::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(TemplateAccessTokens::Token)
                                .string()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(TemplateAccessTokens::OrderId).string().not_null())
                        .col(ColumnDef::new(TemplateAccessTokens::AgentId).string().not_null())
                        .col(ColumnDef::new(TemplateAccessTokens::UserId).string().null())
                        .col(ColumnDef::new(TemplateAccessTokens::Email).string().not_null())
                        .col(
                            ColumnDef::new(TemplateAccessTokens::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(TemplateAccessTokens::ExpiresAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(TemplateAccessTokens::UseCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(TemplateAccessTokens::LastUsedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(TemplateAccessTokens::Revoked)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(TemplateAccessTokens::RevokedReason).string().null())
                        .col(
                            ColumnDef::new(TemplateAccessTokens::RevokedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_template_access_tokens_order_id")
                        .table(TemplateAccessTokens::Table)
                        .col(TemplateAccessTokens::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(TemplateAccessTokens::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum TemplateAccessTokens {
        Table,
        Token,
        OrderId,
        AgentId,
        UserId,
        Email,
        CreatedAt,
        ExpiresAt,
        UseCount,
        LastUsedAt,
        Revoked,
        RevokedReason,
        RevokedAt,
    }
}

mod m20240601_000005_create_invoices_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000005_create_invoices_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Invoices::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Invoices::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Invoices::InvoiceNumber)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(
                            ColumnDef::new(Invoices::OrderId)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Invoices::PaymentId).string().null())
                        .col(ColumnDef::new(Invoices::Provider).string().null())
                        .col(ColumnDef::new(Invoices::CustomerEmail).string().null())
                        .col(ColumnDef::new(Invoices::CustomerName).string().null())
                        .col(ColumnDef::new(Invoices::Items).json().not_null())
                        .col(ColumnDef::new(Invoices::Subtotal).decimal_len(16, 4).not_null())
                        .col(
                            ColumnDef::new(Invoices::TaxAmount)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Invoices::Total).decimal_len(16, 4).not_null())
                        .col(ColumnDef::new(Invoices::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Invoices::Status).string().not_null())
                        .col(
                            ColumnDef::new(Invoices::IssuedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Invoices::PaidAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(Invoices::Metadata).json().not_null())
                        .col(
                            ColumnDef::new(Invoices::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Invoices::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_invoices_status")
                        .table(Invoices::Table)
                        .col(Invoices::Status)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_invoices_customer_email")
                        .table(Invoices::Table)
                        .col(Invoices::CustomerEmail)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Invoices::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Invoices {
        Table,
        Id,
        InvoiceNumber,
        OrderId,
        PaymentId,
        Provider,
        CustomerEmail,
        CustomerName,
        Items,
        Subtotal,
        TaxAmount,
        Total,
        Currency,
        Status,
        IssuedAt,
        PaidAt,
        Metadata,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000006_create_agents_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000006_create_agents_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Agents::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Agents::Id).string().primary_key().not_null())
                        .col(ColumnDef::new(Agents::Title).string().not_null())
                        .col(
                            ColumnDef::new(Agents::Price)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Agents::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Agents::Template).text().null())
                        .col(
                            ColumnDef::new(Agents::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Agents::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Agents::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Agents::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Agents {
        Table,
        Id,
        Title,
        Price,
        Currency,
        Template,
        IsActive,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000007_create_outbox_events_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000007_create_outbox_events_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(OutboxEvents::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(OutboxEvents::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(OutboxEvents::EventType).string().not_null())
                        .col(ColumnDef::new(OutboxEvents::AggregateId).string().null())
                        .col(ColumnDef::new(OutboxEvents::Payload).json().not_null())
                        .col(
                            ColumnDef::new(OutboxEvents::Status)
                                .string()
                                .not_null()
                                .default("pending"),
                        )
                        .col(
                            ColumnDef::new(OutboxEvents::Attempts)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(OutboxEvents::AvailableAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(OutboxEvents::ErrorMessage).text().null())
                        .col(
                            ColumnDef::new(OutboxEvents::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OutboxEvents::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(OutboxEvents::ProcessedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_outbox_events_status_available_at")
                        .table(OutboxEvents::Table)
                        .col(OutboxEvents::Status)
                        .col(OutboxEvents::AvailableAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OutboxEvents::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum OutboxEvents {
        Table,
        Id,
        EventType,
        AggregateId,
        Payload,
        Status,
        Attempts,
        AvailableAt,
        ErrorMessage,
        CreatedAt,
        UpdatedAt,
        ProcessedAt,
    }
}

/// Standalone migration runner used by `marketplace-api migrate`.
pub async fn run_migration(db_url: &str) -> Result<()> {
    info!("Setting up database connection for migrations");

    let mut opt = ConnectOptions::new(db_url);
    opt.max_connections(2)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(30))
        .sqlx_logging(false);

    let db = Database::connect(opt).await?;

    info!("Running database migrations");
    match Migrator::up(&db, None).await {
        Ok(_) => {
            info!("Migrations completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Migration failed: {}", e);
            Err(e.into())
        }
    }
}
