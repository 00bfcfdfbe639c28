use rust_decimal::Decimal;
use serde::Serialize;
use strum::{AsRefStr, Display};
use tracing::warn;

use crate::services::payments::ProviderKind;

pub mod ledger;
pub mod router;

pub use router::WebhookRouter;

/// Provider-independent view of one webhook delivery.
///
/// Adapters build this from their own payload types; everything downstream of
/// signature verification works only with this shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedWebhook {
    pub provider: ProviderKind,
    pub event_id: String,
    pub event_type: String,
    pub provider_session_id: Option<String>,
    pub provider_payment_id: Option<String>,
    /// Provider refund id on refund events.
    pub refund_id: Option<String>,
    /// Status exactly as the provider spelled it.
    pub raw_status: String,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    Success,
    Failed,
    Pending,
    Cancelled,
    Refunded,
    Unknown,
}

/// Maps a provider status or event type onto the internal vocabulary.
pub fn map_status(provider: ProviderKind, raw: &str) -> PaymentOutcome {
    let normalized = raw.trim().to_ascii_lowercase();
    let outcome = match provider {
        ProviderKind::Paypal => match normalized.as_str() {
            "payment.capture.completed" | "completed" => PaymentOutcome::Success,
            "payment.capture.denied" | "payment.capture.declined" | "denied" | "declined"
            | "failed" => PaymentOutcome::Failed,
            "payment.capture.pending" | "checkout.order.approved" | "approved" | "pending"
            | "created" | "saved" | "payer_action_required" => PaymentOutcome::Pending,
            "checkout.order.voided" | "voided" | "cancelled" => PaymentOutcome::Cancelled,
            "payment.capture.refunded" | "payment.capture.reversed" | "refunded" => {
                PaymentOutcome::Refunded
            }
            _ => PaymentOutcome::Unknown,
        },
        ProviderKind::Gateway => match normalized.as_str() {
            "success" | "succeeded" | "paid" | "completed" | "payment.succeeded" => {
                PaymentOutcome::Success
            }
            "failed" | "failure" | "declined" | "rejected" | "error" | "payment.failed" => {
                PaymentOutcome::Failed
            }
            "pending" | "processing" | "created" | "initiated" | "authorized" => {
                PaymentOutcome::Pending
            }
            "cancelled" | "canceled" | "expired" | "aborted" | "payment.cancelled" => {
                PaymentOutcome::Cancelled
            }
            "refunded" | "partially_refunded" | "partiallyrefunded" | "payment.refunded" => {
                PaymentOutcome::Refunded
            }
            _ => PaymentOutcome::Unknown,
        },
        ProviderKind::Wallet => match normalized.as_str() {
            "payment_intent.succeeded" | "succeeded" => PaymentOutcome::Success,
            "payment_intent.payment_failed" | "requires_payment_method" | "failed" => {
                PaymentOutcome::Failed
            }
            "payment_intent.processing" | "payment_intent.requires_action" | "processing"
            | "requires_action" | "requires_confirmation" | "requires_capture" => {
                PaymentOutcome::Pending
            }
            "payment_intent.canceled" | "canceled" | "cancelled" => PaymentOutcome::Cancelled,
            "charge.refunded" | "refunded" => PaymentOutcome::Refunded,
            _ => PaymentOutcome::Unknown,
        },
    };

    if outcome == PaymentOutcome::Unknown {
        warn!(provider = %provider, status = raw, "unrecognised provider status");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ProviderKind::Paypal, "PAYMENT.CAPTURE.COMPLETED", PaymentOutcome::Success)]
    #[case(ProviderKind::Paypal, "COMPLETED", PaymentOutcome::Success)]
    #[case(ProviderKind::Paypal, "PAYMENT.CAPTURE.DENIED", PaymentOutcome::Failed)]
    #[case(ProviderKind::Paypal, "CHECKOUT.ORDER.APPROVED", PaymentOutcome::Pending)]
    #[case(ProviderKind::Paypal, "PAYMENT.CAPTURE.REFUNDED", PaymentOutcome::Refunded)]
    #[case(ProviderKind::Gateway, "Success", PaymentOutcome::Success)]
    #[case(ProviderKind::Gateway, "Succeeded", PaymentOutcome::Success)]
    #[case(ProviderKind::Gateway, "Declined", PaymentOutcome::Failed)]
    #[case(ProviderKind::Gateway, "Expired", PaymentOutcome::Cancelled)]
    #[case(ProviderKind::Gateway, "Processing", PaymentOutcome::Pending)]
    #[case(ProviderKind::Wallet, "payment_intent.succeeded", PaymentOutcome::Success)]
    #[case(ProviderKind::Wallet, "requires_payment_method", PaymentOutcome::Failed)]
    #[case(ProviderKind::Wallet, "charge.refunded", PaymentOutcome::Refunded)]
    #[case(ProviderKind::Wallet, "payment_intent.canceled", PaymentOutcome::Cancelled)]
    #[case(ProviderKind::Gateway, "OnHoldForReview", PaymentOutcome::Unknown)]
    fn provider_vocabulary_maps_to_outcome(
        #[case] provider: ProviderKind,
        #[case] raw: &str,
        #[case] expected: PaymentOutcome,
    ) {
        assert_eq!(map_status(provider, raw), expected);
    }
}
