//! Worker binary: wires config, telemetry, the vault, Postgres, the live
//! event bus, the three worker pools, the pending-job dispatcher, and the
//! WebSocket surface.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use sitepulse_common::{telemetry, Config, Vault};
use sitepulse_live::{AuthedUser, Authenticator, EventBus, PgBroker, WsState};
use sitepulse_queue::{queues, Broker, ProgressSink, QueueConfig};
use sitepulse_store::{PgStore, Store};
use sitepulse_worker::{
    dispatch, GoogleWorker, HttpGoogleApi, HttpIndexNowApi, IndexNowWorker, JobController,
    ScannerWorker,
};

/// Token check for the WebSocket surface. User records belong to the API
/// tier; workers accept `<org-uuid>.<shared-secret>` tokens minted there.
struct SharedSecretAuth {
    secret: Option<String>,
}

#[async_trait]
impl Authenticator for SharedSecretAuth {
    async fn authenticate(&self, token: &str) -> Option<AuthedUser> {
        let secret = self.secret.as_deref()?;
        let (org, presented) = token.split_once('.')?;
        if presented != secret {
            return None;
        }
        Some(AuthedUser {
            user_id: uuid::Uuid::new_v4(),
            organization_id: org.parse().ok()?,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    telemetry::init(&config);
    info!(
        version = %config.app_version,
        env = %config.app_env,
        "sitepulse worker starting"
    );

    let vault = Vault::new(config.encryption_key.clone())
        .context("ENCRYPTION_KEY rejected")?;

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .context("Postgres connection failed")?;
    let pg = PgStore::new(pool.clone());
    pg.migrate().await.context("migrations failed")?;
    let store: Arc<dyn Store> = Arc::new(pg);

    let bus = EventBus::new(Arc::new(PgBroker::new(pool)));
    bus.start();

    let controller = JobController::new(store.clone(), bus.clone());
    let control = controller.control();
    let sink: Arc<dyn ProgressSink> = controller.clone();

    let broker = Broker::new(&[
        QueueConfig {
            concurrency: config.scanner_concurrency,
            ..QueueConfig::scanner()
        },
        QueueConfig {
            concurrency: config.google_concurrency,
            ..QueueConfig::google()
        },
        QueueConfig {
            concurrency: config.indexnow_concurrency,
            ..QueueConfig::indexnow()
        },
    ]);

    let scanner = ScannerWorker::new(
        store.clone(),
        Arc::new(sitepulse_sitemap::HttpFetcher::new()),
        controller.clone(),
    );
    let google = GoogleWorker::new(
        store.clone(),
        Arc::new(HttpGoogleApi::new()),
        vault.clone(),
        controller.clone(),
        config.google_daily_quota,
    );
    let indexnow = IndexNowWorker::new(
        store.clone(),
        Arc::new(HttpIndexNowApi::new()),
        vault,
        controller.clone(),
    );

    let _scanner_pool =
        broker.run(queues::SITEMAP_SCANNER, scanner, control.clone(), sink.clone())?;
    let _google_pool =
        broker.run(queues::GOOGLE_SUBMITTER, google, control.clone(), sink.clone())?;
    let _indexnow_pool = broker.run(queues::INDEXNOW_SUBMITTER, indexnow, control, sink)?;

    tokio::spawn(dispatch::run(store, broker));

    let auth = SharedSecretAuth {
        secret: std::env::var("WS_AUTH_SECRET").ok(),
    };
    let app = sitepulse_live::router(WsState {
        bus,
        auth: Arc::new(auth),
    })
    .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.ws_host, config.ws_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "WebSocket surface listening");

    tokio::select! {
        result = axum::serve(listener, app) => result.context("server exited")?,
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
    }
    Ok(())
}
