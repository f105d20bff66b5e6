use delivery_service::clock::SystemClock;
use delivery_service::fanout::{FanoutBus, RedisFanout};
use delivery_service::{Config, DeliveryError, ProcessContext};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), DeliveryError> {
    delivery_service::logging::init_tracing();
    delivery_service::metrics::init();

    let config = Config::from_env()?;
    info!(process_id = %config.process_id, "delivery engine starting");

    let bus: Arc<dyn FanoutBus> = Arc::new(
        RedisFanout::connect(&config.redis_url)
            .await
            .map_err(DeliveryError::from)?,
    );
    let clock = Arc::new(SystemClock);

    let (context, failures) = ProcessContext::new(config, bus, clock);
    let tasks = context.spawn_background(failures);

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| DeliveryError::Config(format!("signal handler failed: {e}")))?;
    info!("shutdown signal received");

    for task in tasks {
        task.abort();
    }
    Ok(())
}
