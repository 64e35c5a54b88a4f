//! Consumer loop — pulls deliveries one at a time, runs each through the
//! orchestrator and settles it on the broker before pulling the next.
//!
//! Lifecycle: `Idle → Consuming → Draining → Stopped`, published on a
//! `watch` channel. Cancelling the shutdown token moves the loop to
//! `Draining` at once; a delivery already in flight runs to completion and is
//! settled before the loop exits.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::broker::{Delivery, DeliveryHandle, DeliverySource};
use crate::error::BrokerError;
use crate::pipeline::orchestrator::RequestOrchestrator;
use crate::pipeline::types::{MessageProperties, Outcome, RejectReason};

/// State of a consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerState {
    /// Constructed, not yet pulling.
    Idle,
    /// Pulling and processing deliveries.
    Consuming,
    /// Stop requested; finishing the in-flight delivery.
    Draining,
    /// Done. Terminal.
    Stopped,
}

impl ConsumerState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: ConsumerState) -> bool {
        use ConsumerState::*;

        matches!(
            (self, target),
            (Idle, Consuming) | (Idle, Stopped) | (Consuming, Draining) | (Draining, Stopped)
        )
    }
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Consuming => "consuming",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Decides whether a rejected delivery goes back on the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    /// Total delivery attempts allowed. `None` requeues forever.
    pub max_deliveries: Option<u32>,
}

impl RedeliveryPolicy {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn bounded(max_deliveries: u32) -> Self {
        Self {
            max_deliveries: Some(max_deliveries),
        }
    }

    /// Requeue unless this was the last allowed attempt. Without a delivery
    /// count from the broker the attempt is assumed to be the first.
    pub fn should_requeue(&self, properties: &MessageProperties) -> bool {
        match self.max_deliveries {
            None => true,
            Some(max) => {
                let attempt = properties.delivery_count.unwrap_or(0).saturating_add(1);
                attempt < max
            }
        }
    }
}

/// How one delivery ended up on the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Acknowledged,
    Requeued,
    Discarded,
    /// The ack or reject itself failed.
    Failed,
}

/// Settlement counters, returned when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub acknowledged: u64,
    pub requeued: u64,
    /// Rejected without requeue because the redelivery bound was hit.
    pub discarded: u64,
    /// The broker did not accept the ack or reject.
    pub settle_failed: u64,
}

impl ConsumerStats {
    fn record(&mut self, settlement: Settlement) {
        match settlement {
            Settlement::Acknowledged => self.acknowledged += 1,
            Settlement::Requeued => self.requeued += 1,
            Settlement::Discarded => self.discarded += 1,
            Settlement::Failed => self.settle_failed += 1,
        }
    }
}

/// Single-in-flight consumer over one delivery source.
pub struct ConsumerLoop<S> {
    source: S,
    orchestrator: Arc<RequestOrchestrator>,
    redelivery: RedeliveryPolicy,
    state: watch::Sender<ConsumerState>,
    stats: ConsumerStats,
}

impl<S: DeliverySource> ConsumerLoop<S> {
    pub fn new(source: S, orchestrator: Arc<RequestOrchestrator>) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            source,
            orchestrator,
            redelivery: RedeliveryPolicy::unbounded(),
            state,
            stats: ConsumerStats::default(),
        }
    }

    pub fn with_redelivery_policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery = policy;
        self
    }

    /// Receiver that follows the loop's state, also after `run` has taken
    /// ownership of the loop.
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Consume until `shutdown` is cancelled or the source ends.
    ///
    /// Processing failures never end the loop. A failing delivery stream
    /// does: the error is returned after the source has been closed.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<ConsumerStats, BrokerError> {
        if shutdown.is_cancelled() {
            transition(&self.state, ConsumerState::Stopped);
            return Ok(self.stats);
        }

        transition(&self.state, ConsumerState::Consuming);
        info!("Consumer loop started");

        let result = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                next = self.source.next_delivery() => Some(next),
            };

            let delivery = match next {
                None => {
                    info!("Received shutdown signal, stopping consumer");
                    break Ok(());
                }
                Some(Some(Ok(delivery))) => delivery,
                Some(Some(Err(e))) => {
                    error!(error = %e, "Delivery stream failed");
                    break Err(e);
                }
                Some(None) => {
                    warn!("Delivery stream ended");
                    break Ok(());
                }
            };

            // The in-flight delivery is never cancelled; a shutdown only
            // switches the state while it finishes.
            let handling = process_delivery(&self.orchestrator, self.redelivery, delivery);
            tokio::pin!(handling);
            let settlement = tokio::select! {
                biased;
                settlement = &mut handling => settlement,
                _ = shutdown.cancelled() => {
                    info!("Received shutdown signal, draining in-flight message");
                    transition(&self.state, ConsumerState::Draining);
                    handling.await
                }
            };
            self.stats.record(settlement);

            if shutdown.is_cancelled() {
                info!("In-flight message settled, stopping consumer");
                break Ok(());
            }
        };

        let current = *self.state.borrow();
        if current != ConsumerState::Draining {
            transition(&self.state, ConsumerState::Draining);
        }
        self.source.close().await;
        transition(&self.state, ConsumerState::Stopped);

        info!(
            acknowledged = self.stats.acknowledged,
            requeued = self.stats.requeued,
            discarded = self.stats.discarded,
            settle_failed = self.stats.settle_failed,
            "Consumer stopped"
        );

        result.map(|()| self.stats)
    }
}

fn transition(state: &watch::Sender<ConsumerState>, target: ConsumerState) {
    let from = state.send_replace(target);
    if !from.can_transition_to(target) {
        warn!(from = %from, to = %target, "Unexpected consumer state transition");
    }
    debug!(from = %from, to = %target, "Consumer state transition");
}

/// Process one delivery and settle it.
async fn process_delivery(
    orchestrator: &RequestOrchestrator,
    redelivery: RedeliveryPolicy,
    delivery: Delivery,
) -> Settlement {
    let Delivery { envelope, handle } = delivery;
    let properties = envelope.properties();

    let span = info_span!(
        "card_request",
        delivery_tag = properties.delivery_tag,
        message_id = properties.message_id.as_deref().unwrap_or("-"),
        redelivered = properties.redelivered,
    );

    let outcome = AssertUnwindSafe(orchestrator.process(&envelope))
        .catch_unwind()
        .instrument(span.clone())
        .await
        .unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            span.in_scope(|| error!(panic = %message, "Message processing panicked"));
            Outcome::Reject(RejectReason::Panicked(message))
        });

    let settlement = settle(outcome, properties, handle, redelivery)
        .instrument(span.clone())
        .await;

    let elapsed = Utc::now() - envelope.received_at();
    span.in_scope(|| {
        info!(
            ?settlement,
            elapsed_ms = elapsed.num_milliseconds(),
            "Finished processing message"
        )
    });
    settlement
}

async fn settle(
    outcome: Outcome,
    properties: &MessageProperties,
    handle: Box<dyn DeliveryHandle>,
    redelivery: RedeliveryPolicy,
) -> Settlement {
    match outcome {
        Outcome::Acknowledge => match handle.ack().await {
            Ok(()) => Settlement::Acknowledged,
            Err(e) => {
                error!(error = %e, "Failed to acknowledge message");
                Settlement::Failed
            }
        },
        Outcome::Reject(reason) => {
            let requeue = redelivery.should_requeue(properties);
            if requeue {
                warn!(reason = reason.label(), error = %reason, "Rejecting message for redelivery");
            } else {
                error!(
                    reason = reason.label(),
                    error = %reason,
                    delivery_count = ?properties.delivery_count,
                    "Redelivery limit reached, rejecting message without requeue"
                );
            }
            match handle.reject(requeue).await {
                Ok(()) if requeue => Settlement::Requeued,
                Ok(()) => Settlement::Discarded,
                Err(e) => {
                    error!(error = %e, "Failed to reject message");
                    Settlement::Failed
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
