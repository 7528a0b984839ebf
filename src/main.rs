use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Router};
use axum_prometheus::PrometheusMetricLayer;
use chrono::Duration;
use marketplace_entitlements::config::{self, StoreBackend};
use marketplace_entitlements::entitlements::{
    spawn_expiry_scheduler, EntitlementEngine, EntitlementStore, ExpiryReconciler, MemoryStore,
    PgStore, PlanResolver, UsageCounter, UsageLedger, WebhookIngress,
};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if the webhook secret is missing
    let secret = config::PAYMENT_WEBHOOK_SECRET.as_str();
    let resolver = PlanResolver::new(*config::PRICE_TABLE).context("invalid price table")?;

    let (store, ledger): (Arc<dyn EntitlementStore>, Arc<dyn UsageLedger>) =
        match *config::ENTITLEMENT_STORE {
            StoreBackend::Postgres => {
                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect(config::DATABASE_URL.as_str())
                    .await
                    .context("failed to connect to DATABASE_URL")?;

                if let Err(error) = sqlx::migrate!().run(&pool).await {
                    if *config::ALLOW_MIGRATION_FAILURE {
                        tracing::warn!(
                            ?error,
                            "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
                        );
                    } else {
                        return Err(error).context("database migrations failed");
                    }
                }

                let store = Arc::new(PgStore::new(pool));
                let ledger: Arc<dyn UsageLedger> = store.clone();
                (store as Arc<dyn EntitlementStore>, ledger)
            }
            StoreBackend::Memory => {
                tracing::warn!("using in-memory entitlement store; state is lost on restart");
                let store = Arc::new(MemoryStore::new());
                let ledger: Arc<dyn UsageLedger> = store.clone();
                (store as Arc<dyn EntitlementStore>, ledger)
            }
        };

    let reconciler = Arc::new(ExpiryReconciler::with_batch_size(
        store.clone(),
        *config::EXPIRY_SWEEP_BATCH_SIZE,
    ));
    let sweep = spawn_expiry_scheduler(
        reconciler,
        std::time::Duration::from_secs(*config::EXPIRY_SWEEP_INTERVAL_SECS),
    );

    let ingress = WebhookIngress::new(store.clone(), resolver, secret.as_bytes().to_vec())
        .with_plan_duration(Duration::days(*config::PLAN_DURATION_DAYS))
        .with_sweep_trigger(sweep);
    let usage = UsageCounter::with_window(
        ledger,
        *config::QUOTA_LIMITS,
        Duration::days(*config::USAGE_WINDOW_DAYS),
    );
    let engine = EntitlementEngine::from_parts(store, Arc::new(ingress), Arc::new(usage))
        .with_signature_header(config::PAYMENT_SIGNATURE_HEADER.as_str());

    tracing::info!(
        backend = config::ENTITLEMENT_STORE.as_str(),
        prices = ?*config::PRICE_TABLE,
        limits = ?*config::QUOTA_LIMITS,
        "entitlement engine configured"
    );

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(marketplace_entitlements::app(engine))
        .layer(prometheus_layer);

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .context("invalid BIND_ADDRESS/BIND_PORT")?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
