//! Shared types for the card request pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, HttpError};

// ── Card request ────────────────────────────────────────────────────

/// A validated card application request.
///
/// Only produced by [`crate::pipeline::validator::validate`]; every field is
/// present and of the declared type. `card_request_id` correlates all work
/// done for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardRequest {
    pub user_id: i64,
    #[serde(rename = "app_id")]
    pub app_id: String,
    pub card_type: String,
    pub card_category: String,
    pub card_balance: f64,
    /// ISO-4217-like code, not enforced.
    pub currency: String,
    pub first_name: String,
    pub last_name: String,
    pub card_request_id: i64,
    pub phone: String,
}

// ── Envelope ────────────────────────────────────────────────────────

/// Broker-assigned metadata of one delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Channel-scoped delivery tag.
    pub delivery_tag: u64,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    /// Broker has delivered this message before.
    pub redelivered: bool,
    /// Prior delivery attempts as reported by the `x-delivery-count` header.
    pub delivery_count: Option<u32>,
}

/// One unit of delivery from the queue: the raw body plus its metadata.
///
/// The pipeline never mutates an envelope.
#[derive(Debug, Clone)]
pub struct Envelope {
    body: Vec<u8>,
    properties: MessageProperties,
    received_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(body: impl Into<Vec<u8>>, properties: MessageProperties) -> Self {
        Self {
            body: body.into(),
            properties,
            received_at: Utc::now(),
        }
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    /// When the worker took the delivery off the queue.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Parse the body as JSON.
    pub fn decode(&self) -> Result<serde_json::Value, DecodeError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Body as text for debug logging.
    pub fn body_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

// ── Derived messages ────────────────────────────────────────────────

/// Status carried by an approval notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Approved,
}

/// Approval notification published back onto the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalNotification {
    pub user_id: i64,
    pub card_request_id: i64,
    pub status: ApprovalStatus,
}

impl From<&CardRequest> for ApprovalNotification {
    fn from(request: &CardRequest) -> Self {
        Self {
            user_id: request.user_id,
            card_request_id: request.card_request_id,
            status: ApprovalStatus::Approved,
        }
    }
}

/// Body of the card-generation request: a renamed projection of
/// [`CardRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningPayload {
    pub user_id: i64,
    pub card_request_id: i64,
    pub phone: String,
    pub card_type: String,
    pub card_category: String,
    pub card_balance: f64,
    pub currency: String,
    pub cardholder_firstname: String,
    pub cardholder_lastname: String,
}

impl From<&CardRequest> for ProvisioningPayload {
    fn from(request: &CardRequest) -> Self {
        Self {
            user_id: request.user_id,
            card_request_id: request.card_request_id,
            phone: request.phone.clone(),
            card_type: request.card_type.clone(),
            card_category: request.card_category.clone(),
            card_balance: request.card_balance,
            currency: request.currency.clone(),
            cardholder_firstname: request.first_name.clone(),
            cardholder_lastname: request.last_name.clone(),
        }
    }
}

// ── Outcome ─────────────────────────────────────────────────────────

/// Why a delivery is handed back to the broker.
#[derive(Debug, thiserror::Error)]
pub enum RejectReason {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Downstream(#[from] HttpError),

    #[error("Processing panicked: {0}")]
    Panicked(String),
}

impl RejectReason {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::Downstream(_) => "downstream",
            Self::Panicked(_) => "panicked",
        }
    }
}

/// Acknowledgment decision for one delivery.
#[derive(Debug)]
pub enum Outcome {
    /// Fully handled; must not be redelivered.
    Acknowledge,
    /// Return to the queue for redelivery.
    Reject(RejectReason),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> CardRequest {
        CardRequest {
            user_id: 1,
            app_id: "x".into(),
            card_type: "debit".into(),
            card_category: "standard".into(),
            card_balance: 0.0,
            currency: "USD".into(),
            first_name: "A".into(),
            last_name: "B".into(),
            card_request_id: 100,
            phone: "+1".into(),
        }
    }

    #[test]
    fn approval_serializes_to_wire_shape() {
        let notification = ApprovalNotification::from(&sample_request());
        let json = serde_json::to_value(&notification).unwrap();

        assert_eq!(
            json,
            serde_json::json!({"userId": 1, "cardRequestId": 100, "status": "APPROVED"})
        );
    }

    #[test]
    fn provisioning_payload_renames_fields() {
        let payload = ProvisioningPayload::from(&sample_request());
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "user_id": 1,
                "card_request_id": 100,
                "phone": "+1",
                "card_type": "debit",
                "card_category": "standard",
                "card_balance": 0.0,
                "currency": "USD",
                "cardholder_firstname": "A",
                "cardholder_lastname": "B"
            })
        );
    }

    #[test]
    fn provisioning_payload_projection_is_idempotent() {
        let request = sample_request();
        assert_eq!(
            ProvisioningPayload::from(&request),
            ProvisioningPayload::from(&request)
        );
    }

    #[test]
    fn card_request_serializes_with_inbound_names() {
        let json = serde_json::to_value(sample_request()).unwrap();
        assert_eq!(json["app_id"], "x");
        assert_eq!(json["cardRequestId"], 100);
        assert_eq!(json["firstName"], "A");
    }

    #[test]
    fn envelope_decode_rejects_garbage() {
        let envelope = Envelope::new(b"not json".to_vec(), MessageProperties::default());
        assert!(envelope.decode().is_err());
        assert_eq!(envelope.body_lossy(), "not json");
    }

    #[test]
    fn reject_reason_labels() {
        let reason = RejectReason::Panicked("boom".into());
        assert_eq!(reason.label(), "panicked");
    }
}
