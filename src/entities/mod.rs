pub mod agent;
pub mod invoice;
pub mod order;
pub mod outbox_event;
pub mod payment_session;
pub mod template_access_token;
pub mod webhook_event;
