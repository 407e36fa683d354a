//! Consume doorbell events: recognize the visitor, store the result and notify the household.
use std::sync::Arc;
use std::time;

use envconfig::Envconfig;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use doorbell_common::{
    database::{connect_lazy, run_migrations},
    events::PgEventSource,
    metrics::{serve, setup_metrics_routes},
    notification::PushNotifier,
    recognition::HttpRecognitionOracle,
    results::PgResultSink,
    retry::RetryPolicy,
    visitors::PgVisitorStore,
};
use doorbell_worker::config::Config;
use doorbell_worker::error::WorkerError;
use doorbell_worker::handlers::app;
use doorbell_worker::image::HttpImageFetcher;
use doorbell_worker::listener::DoorbellListener;
use doorbell_worker::pipeline::Pipeline;
use doorbell_worker::sweeper::StaleClaimSweeper;
use health::HealthRegistry;

/// How long the listener may go without polling before it is reported stalled.
const LISTENER_DEADLINE: time::Duration = time::Duration::from_secs(60);

async fn wait_for_shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match tokio::signal::unix::signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(error) => {
            tracing::error!("failed to install SIGTERM handler: {}", error);
            if let Err(error) = ctrl_c.await {
                tracing::error!("failed to listen for SIGINT: {}", error);
            }
            shutdown.cancel();
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let pool = connect_lazy(
        &config.database_url,
        config.max_pg_connections,
        &config.worker_name,
    )?;
    if config.run_migrations {
        run_migrations(&pool).await?;
    }

    let source = Arc::new(PgEventSource::new_from_pool(pool.clone()));
    let pipeline = Arc::new(Pipeline::new(
        Arc::new(HttpRecognitionOracle::new(
            &config.oracle_url,
            config.oracle_timeout.0,
        )?),
        Arc::new(PgVisitorStore::new_from_pool(pool.clone())),
        Arc::new(PgResultSink::new_from_pool(pool)),
        Arc::new(PushNotifier::new(
            &config.push_url,
            config.push_token.clone(),
            config.push_timeout.0,
        )?),
        Arc::new(HttpImageFetcher::new(
            config.image_fetch_timeout.0,
            config.max_image_bytes,
        )?),
        config.notification_topic.as_str(),
    ));

    let retry_policy = RetryPolicy::build(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
    )
    .maximum_interval(config.retry_policy.maximum_interval.0)
    .provide();

    let liveness = HealthRegistry::new("liveness");
    let listener = DoorbellListener::new(
        &config.worker_name,
        source.clone(),
        pipeline,
        config.poll_interval.0,
        config.poll_batch_size,
        config.max_concurrent_events,
        retry_policy,
        liveness.register("listener", LISTENER_DEADLINE + config.poll_interval.0),
    );
    let sweeper = StaleClaimSweeper::new(
        source,
        config.sweep_interval.0,
        config.stale_claim_timeout.0,
        liveness.register("sweeper", config.sweep_interval.0 * 4),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_shutdown_signal(shutdown.clone()));

    let router = setup_metrics_routes(app(liveness))?;
    let bind = config.bind();
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(error) = serve(router, &bind, server_shutdown.clone().cancelled_owned()).await {
            tracing::error!("failed to serve health and metrics endpoints: {}", error);
            server_shutdown.cancel();
        }
    });

    let sweeper_shutdown = shutdown.clone();
    let sweeper = tokio::spawn(async move { sweeper.run(sweeper_shutdown).await });

    listener.run(shutdown.clone()).await;

    shutdown.cancel();
    for task in [sweeper, server] {
        if let Err(error) = task.await {
            tracing::error!("background task failed: {}", error);
        }
    }
    tracing::info!("doorbell worker stopped");

    Ok(())
}
