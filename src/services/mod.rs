// Order store and reconciliation
pub mod order_processor;
pub mod orders;
pub mod session_registry;

// Delivery collaborators
pub mod agent_content;
pub mod notifications;
pub mod template_access;

// Financial services
pub mod invoicing;
pub mod payments;
