//! Broker entry-point: configuration, migrations, background workers, and
//! the HTTP/WebSocket server.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, HttpServer, web};
use diesel::{Connection, PgConnection};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use mockable::{Clock, DefaultClock};
use ortho_config::OrthoConfig;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use url::Url;

use backend::config::BrokerSettings;
use backend::domain::delivery_worker::{DeliveryWorker, PushTransports};
use backend::domain::fanout::FanoutWorker;
use backend::domain::ingestion::IngestionService;
use backend::domain::jobs::{DELIVER_QUEUE, DeliveryJob, FANOUT_QUEUE, FanoutJob};
use backend::domain::ports::{
    ConnectionRegistry, DeliveryRepository, JobQueue, MessageRepository, PushTransport,
    SubscriberDirectory,
};
use backend::domain::replay::ReplayService;
use backend::domain::sweeper::TtlSweeper;
use backend::inbound::http::{self, state::HttpState};
use backend::inbound::ws::{self, WsState};
use backend::outbound::persistence::{
    DbPool, DieselDeliveryRepository, DieselMessageRepository, DieselSubscriberDirectory,
    PoolConfig,
};
use backend::outbound::push::{HttpPushGateway, NoopPushSender};
use backend::outbound::queue::{DieselJobQueue, HandlerOutcome, JobQueueConfig, run_worker};
use backend::registry::SocketRegistry;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Application bootstrap.
#[actix_web::main]
async fn main() -> io::Result<()> {
    if let Err(e) = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .try_init()
    {
        warn!(error = %e, "tracing init failed");
    }

    let settings = BrokerSettings::load().map_err(io::Error::other)?;
    let database_url = settings
        .database_url
        .clone()
        .ok_or_else(|| io::Error::other("BROKER_DATABASE_URL must be set"))?;

    run_migrations(database_url.clone()).await?;

    let pool = DbPool::new(PoolConfig::new(&database_url))
        .await
        .map_err(io::Error::other)?;
    let clock: Arc<dyn Clock> = Arc::new(DefaultClock);

    let messages: Arc<dyn MessageRepository> =
        Arc::new(DieselMessageRepository::new(pool.clone()));
    let deliveries: Arc<dyn DeliveryRepository> =
        Arc::new(DieselDeliveryRepository::new(pool.clone()));
    let directory: Arc<dyn SubscriberDirectory> =
        Arc::new(DieselSubscriberDirectory::new(pool.clone()));
    let job_queue = Arc::new(DieselJobQueue::new(
        pool,
        Arc::clone(&clock),
        JobQueueConfig {
            lease_timeout: settings.lease_timeout(),
            retry: settings.retry_policy(),
        },
    ));
    let queue_port: Arc<dyn JobQueue> = Arc::clone(&job_queue) as Arc<dyn JobQueue>;

    let registry = Arc::new(SocketRegistry::new(Arc::clone(&clock)));
    let registry_port: Arc<dyn ConnectionRegistry> =
        Arc::clone(&registry) as Arc<dyn ConnectionRegistry>;

    let transports = PushTransports {
        webpush: Some(build_transport(
            settings.webpush_endpoint.as_deref(),
            settings.push_timeout(),
        )?),
        apns: Some(build_transport(
            settings.apns_endpoint.as_deref(),
            settings.push_timeout(),
        )?),
        fcm: Some(build_transport(
            settings.fcm_endpoint.as_deref(),
            settings.push_timeout(),
        )?),
    };

    let ingestion = Arc::new(IngestionService::new(
        Arc::clone(&messages),
        Arc::clone(&directory),
        Arc::clone(&queue_port),
        Arc::clone(&registry_port),
        Arc::clone(&clock),
        settings.ingestion_config(),
    ));
    let replay = Arc::new(ReplayService::new(Arc::clone(&queue_port)));

    spawn_workers(&settings, WorkerDeps {
        messages: Arc::clone(&messages),
        deliveries: Arc::clone(&deliveries),
        directory,
        queue_port: Arc::clone(&queue_port),
        registry_port,
        transports,
        clock: Arc::clone(&clock),
        job_queue,
    });

    let http_state = web::Data::new(HttpState::new(
        ingestion,
        replay,
        Arc::clone(&messages),
        Arc::clone(&deliveries),
    ));
    let ws_state = web::Data::new(WsState { registry });

    let bind_addr = settings.bind_addr().to_owned();
    info!(%bind_addr, "starting notification broker");
    HttpServer::new(move || {
        App::new()
            .app_data(http_state.clone())
            .app_data(ws_state.clone())
            .configure(http::configure)
            .service(ws::socket_entry)
    })
    .bind(bind_addr.as_str())?
    .run()
    .await
}

/// Port bundle consumed by the background worker tasks.
struct WorkerDeps {
    messages: Arc<dyn MessageRepository>,
    deliveries: Arc<dyn DeliveryRepository>,
    directory: Arc<dyn SubscriberDirectory>,
    queue_port: Arc<dyn JobQueue>,
    registry_port: Arc<dyn ConnectionRegistry>,
    transports: PushTransports,
    clock: Arc<dyn Clock>,
    job_queue: Arc<DieselJobQueue>,
}

/// Spawn the TTL sweeper plus the fan-out and delivery worker pools.
fn spawn_workers(settings: &BrokerSettings, deps: WorkerDeps) {
    let sweeper = Arc::new(TtlSweeper::new(
        Arc::clone(&deps.messages),
        Arc::clone(&deps.deliveries),
        Arc::clone(&deps.clock),
        settings.retention(),
    ));
    tokio::spawn(sweeper.run(settings.sweep_interval()));

    let fanout = Arc::new(FanoutWorker::new(
        Arc::clone(&deps.messages),
        Arc::clone(&deps.deliveries),
        deps.directory,
        deps.queue_port,
        Arc::clone(&deps.clock),
    ));
    for _ in 0..settings.fanout_workers() {
        let queue = Arc::clone(&deps.job_queue);
        let worker = Arc::clone(&fanout);
        let poll = settings.poll_interval();
        tokio::spawn(async move {
            run_worker(queue, FANOUT_QUEUE, poll, move |payload| {
                let worker = Arc::clone(&worker);
                async move { fanout_verdict(&worker, payload).await }
            })
            .await;
        });
    }

    let delivery = Arc::new(DeliveryWorker::new(
        Arc::clone(&deps.messages),
        Arc::clone(&deps.deliveries),
        deps.registry_port,
        deps.transports,
        Arc::clone(&deps.clock),
    ));
    for _ in 0..settings.delivery_workers() {
        let queue = Arc::clone(&deps.job_queue);
        let worker = Arc::clone(&delivery);
        let poll = settings.poll_interval();
        tokio::spawn(async move {
            run_worker(queue, DELIVER_QUEUE, poll, move |payload| {
                let worker = Arc::clone(&worker);
                async move { delivery_verdict(&worker, payload).await }
            })
            .await;
        });
    }
}

async fn fanout_verdict(worker: &FanoutWorker, payload: serde_json::Value) -> HandlerOutcome {
    let job: FanoutJob = match serde_json::from_value(payload) {
        Ok(job) => job,
        Err(error) => {
            return HandlerOutcome::Discard(format!("malformed fan-out payload: {error}"));
        }
    };
    match worker.process(&job).await {
        Ok(_outcome) => HandlerOutcome::Done,
        Err(error) => HandlerOutcome::Retry(error.to_string()),
    }
}

async fn delivery_verdict(worker: &DeliveryWorker, payload: serde_json::Value) -> HandlerOutcome {
    let job: DeliveryJob = match serde_json::from_value(payload) {
        Ok(job) => job,
        Err(error) => {
            return HandlerOutcome::Discard(format!("malformed delivery payload: {error}"));
        }
    };
    match worker.process(&job).await {
        Ok(_outcome) => HandlerOutcome::Done,
        Err(error) => HandlerOutcome::Retry(error.to_string()),
    }
}

///// Build one push transport: a gateway when an endpoint is configured, the
/// no-op sender otherwise.
fn build_transport(
    endpoint: Option<&str>,
    timeout: Duration,
) -> io::Result<Arc<dyn PushTransport>> {
    match endpoint {
        Some(raw) => {
            let url = Url::parse(raw)
                .map_err(|error| io::Error::other(format!("invalid push endpoint {raw}: {error}")))?;
            let gateway = HttpPushGateway::new(url, timeout).map_err(io::Error::other)?;
            Ok(Arc::new(gateway))
        }
        None => Ok(Arc::new(NoopPushSender)),
    }
}

/// Apply pending schema migrations before serving traffic.
async fn run_migrations(database_url: String) -> io::Result<()> {
    tokio::task::spawn_blocking(move || {
        let mut conn = PgConnection::establish(&database_url)
            .map_err(|error| io::Error::other(format!("database connection failed: {error}")))?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|error| io::Error::other(format!("migrations failed: {error}")))?;
        info!(count = applied.len(), "schema migrations applied");
        Ok(())
    })
    .await
    .map_err(io::Error::other)?
}
