use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use courier_common::config::AppConfig;
use courier_common::db;
use courier_common::redis_pool::create_redis_pool;
use courier_common::types::ChannelKind;
use courier_engine::idempotency::RedisIdempotencyLocks;
use courier_engine::ports::MessageBus;
use courier_engine::queue::RedisMessageBus;
use courier_engine::retention::Sweeper;
use courier_engine::store::PgNotificationStore;
use courier_engine::{DispatchService, RetryPolicy};

use courier_notifier::channels::ChannelRegistry;
use courier_notifier::channels::email::EmailSender;
use courier_notifier::channels::push::{PushSender, SessionRegistry};
use courier_notifier::channels::queue::OutboundStreamSender;
use courier_notifier::gateway;
use courier_notifier::intake::{IntakeConsumer, IntakeHandler};
use courier_notifier::template::TemplateRegistry;
use courier_notifier::worker::WorkerPool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "courier_notifier=info,courier_engine=info,tower_http=info".into()
            }),
        )
        .json()
        .init();

    tracing::info!("Courier notifier starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;
    let redis = create_redis_pool(&config.redis_url).await?;

    let store = Arc::new(PgNotificationStore::new(pool));
    let locks = Arc::new(RedisIdempotencyLocks::new(redis.clone()));
    let redis_bus = Arc::new(RedisMessageBus::new(redis.clone()));
    let bus: Arc<dyn MessageBus> = redis_bus.clone();

    let service = Arc::new(DispatchService::new(
        store,
        locks,
        bus.clone(),
        RetryPolicy::from_config(&config),
        Duration::from_secs(config.idempotency_ttl_secs),
    ));

    let templates = Arc::new(TemplateRegistry::new());
    let sessions = Arc::new(SessionRegistry::new());

    let mut registry = ChannelRegistry::new()
        .with(Arc::new(PushSender::new(sessions.clone(), templates.clone())))
        .with(Arc::new(OutboundStreamSender::new(
            redis.clone(),
            config.outbound_stream.clone(),
        )));
    match (&config.email_api_key, &config.email_from) {
        (Some(key), Some(from)) => {
            registry.register(Arc::new(EmailSender::new(
                config.email_api_url.clone(),
                key.clone(),
                from.clone(),
                templates.clone(),
            )?));
        }
        _ => tracing::warn!("EMAIL_API_KEY or EMAIL_FROM not set, email channel disabled"),
    }
    tracing::info!(channels = ?registry.channels(), "Channel senders registered");

    // Tasks a previous process took but never acknowledged.
    for channel in ChannelKind::ALL {
        let recovered = redis_bus.recover_in_flight(channel).await?;
        if recovered > 0 {
            tracing::info!(channel = %channel, recovered, "Recovered in-flight tasks");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let workers = WorkerPool::new(service.clone(), bus.clone(), registry, config.workers_per_channel);
    let mut handles = workers.spawn(shutdown_rx.clone());

    let sweeper = Sweeper::from_config(service.clone(), &config);
    let sweeper_shutdown = shutdown_rx.clone();
    handles.push(tokio::spawn(async move {
        sweeper.run(sweeper_shutdown).await;
    }));

    let intake = IntakeConsumer::new(
        IntakeHandler::new(service),
        redis,
        config.intake_queue.clone(),
    );
    let intake_shutdown = shutdown_rx.clone();
    handles.push(tokio::spawn(async move {
        intake.run(intake_shutdown).await;
    }));

    let app = gateway::router_with_heartbeat(sessions, gateway::Heartbeat::from_config(&config))
        .layer(TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(&config.push_gateway_addr).await?;
    tracing::info!(addr = %config.push_gateway_addr, "Push gateway listening");

    let mut gateway_shutdown = shutdown_rx;
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = gateway_shutdown.wait_for(|stop| *stop).await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Push gateway exited with error");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");
    shutdown_tx.send(true)?;

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Background task panicked");
        }
    }
    if let Err(e) = server.await {
        tracing::error!(error = %e, "Push gateway task panicked");
    }

    tracing::info!("Courier notifier stopped.");
    Ok(())
}
