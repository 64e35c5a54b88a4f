//! Request orchestrator — runs one envelope through the pipeline and decides
//! how the broker should settle it.
//!
//! Flow, strictly sequential:
//! 1. Decode the body → `Reject` if it is not JSON
//! 2. Validate → invalid requests are logged and acknowledged (dropped)
//! 3. Publish the approval → failure is logged, processing continues
//! 4. Request card generation → transport failure is `Reject`
//! 5. `Acknowledge`
//!
//! An approval that was published stays published even if step 4 fails.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::broker::ApprovalPublisher;
use crate::pipeline::types::{
    ApprovalNotification, Envelope, Outcome, ProvisioningPayload, RejectReason,
};
use crate::pipeline::validator;
use crate::provisioning::CardGenerationClient;

/// Sequences validation and the two downstream calls for one message.
pub struct RequestOrchestrator {
    publisher: Arc<dyn ApprovalPublisher>,
    card_client: Arc<dyn CardGenerationClient>,
}

impl RequestOrchestrator {
    pub fn new(
        publisher: Arc<dyn ApprovalPublisher>,
        card_client: Arc<dyn CardGenerationClient>,
    ) -> Self {
        Self {
            publisher,
            card_client,
        }
    }

    /// Process a single envelope. Never fails; every error becomes an
    /// [`Outcome`].
    pub async fn process(&self, envelope: &Envelope) -> Outcome {
        info!("Received message. Starting processing");
        debug!(body = %envelope.body_lossy(), "Received body");
        debug!(properties = ?envelope.properties(), "Received properties");

        let body = match envelope.decode() {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Failed to decode message body");
                return Outcome::Reject(RejectReason::Decode(e));
            }
        };

        let request = match validator::validate(&body) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    error = %e,
                    invalid_fields = e.issues().len(),
                    "Invalid request data. Dropping message"
                );
                return Outcome::Acknowledge;
            }
        };

        info!(
            card_request_id = request.card_request_id,
            user_id = request.user_id,
            card_type = %request.card_type,
            "Validated card request"
        );

        let notification = ApprovalNotification::from(&request);
        match self.publisher.publish(&notification).await {
            Ok(()) => info!(
                card_request_id = request.card_request_id,
                "Approval message published"
            ),
            Err(e) => error!(
                card_request_id = request.card_request_id,
                error = %e,
                "Failed to publish approval message; continuing with card generation"
            ),
        }

        let payload = ProvisioningPayload::from(&request);
        match self.card_client.request_card_generation(&payload).await {
            Ok(response) => {
                if response.is_success() {
                    info!(
                        card_request_id = request.card_request_id,
                        status = response.status,
                        "Card generation requested"
                    );
                } else {
                    warn!(
                        card_request_id = request.card_request_id,
                        status = response.status,
                        body = %response.body,
                        "Card generation service answered with an error status"
                    );
                }
                Outcome::Acknowledge
            }
            Err(e) => {
                error!(
                    card_request_id = request.card_request_id,
                    error = %e,
                    "Card generation request failed"
                );
                Outcome::Reject(RejectReason::Downstream(e))
            }
        }
    }
}
