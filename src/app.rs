//! Worker lifecycle: connect, wire the pipeline, consume until shutdown,
//! disconnect.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::broker::RabbitMqAdapter;
use crate::config::{CARD_REQUEST_QUEUE, Settings};
use crate::error::Result;
use crate::pipeline::{ConsumerLoop, ConsumerStats, RedeliveryPolicy, RequestOrchestrator};
use crate::provisioning::HttpCardGenerationClient;

/// Run the worker until `shutdown` is cancelled.
///
/// A broker that cannot be reached at startup is an error. Once connected,
/// the broker session is closed on every exit path.
pub async fn run(settings: Settings, shutdown: CancellationToken) -> Result<ConsumerStats> {
    let mut broker = RabbitMqAdapter::new(settings.broker.clone());
    broker.connect().await?;

    let result = consume(&broker, &settings, shutdown).await;
    if let Err(e) = &result {
        error!(error = %e, "Worker stopped with an error");
    }

    broker.disconnect().await;
    info!("Application shutdown complete");
    result
}

async fn consume(
    broker: &RabbitMqAdapter,
    settings: &Settings,
    shutdown: CancellationToken,
) -> Result<ConsumerStats> {
    let orchestrator = Arc::new(RequestOrchestrator::new(
        Arc::new(broker.approval_publisher()?),
        Arc::new(HttpCardGenerationClient::new(
            settings.card_generation_url.clone(),
        )),
    ));

    let redelivery = settings
        .max_deliveries
        .map_or_else(RedeliveryPolicy::unbounded, RedeliveryPolicy::bounded);

    let source = broker.consume(CARD_REQUEST_QUEUE).await?;
    info!(
        queue = CARD_REQUEST_QUEUE,
        ?redelivery,
        "Started consuming card application requests"
    );

    let consumer = ConsumerLoop::new(source, orchestrator).with_redelivery_policy(redelivery);
    let state = consumer.watch_state();
    let result = consumer.run(shutdown).await;
    let final_state = *state.borrow();
    debug!(state = %final_state, "Consumer loop returned");

    Ok(result?)
}
