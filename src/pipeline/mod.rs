//! Card request processing pipeline.
//!
//! Every delivery from the request queue flows through:
//! 1. `ConsumerLoop` — pulls one delivery at a time, settles it on the broker
//! 2. `RequestOrchestrator::process()` — decode, validate, approve, provision
//! 3. `validator::validate()` — schema-checked parse into a `CardRequest`
//!
//! Processing failures are contained per message; none of them stops the loop.

pub mod consumer;
pub mod orchestrator;
pub mod types;
pub mod validator;

pub use consumer::{ConsumerLoop, ConsumerState, ConsumerStats, RedeliveryPolicy};
pub use orchestrator::RequestOrchestrator;
pub use types::{
    ApprovalNotification, ApprovalStatus, CardRequest, Envelope, MessageProperties, Outcome,
    ProvisioningPayload, RejectReason,
};
