//! Courier webhook delivery service.
//!
//! Loads configuration, connects to PostgreSQL, starts the delivery engine
//! and serves the management API until a shutdown signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_api::{AppState, Config};
use courier_core::{storage::Storage, Clock, RealClock};
use courier_delivery::{storage::PostgresDeliveryStorage, DeliveryEngine};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config)?;

    info!("starting courier webhook delivery service");
    let addr = config.parse_server_addr()?;
    info!(
        database_url = %config.database_url_masked(),
        server_addr = %addr,
        max_connections = config.database_max_connections,
        workers = config.worker_count,
        "configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    run_migrations(&db_pool).await?;
    info!("database schema ready");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let storage = Arc::new(PostgresDeliveryStorage::new(Arc::new(Storage::new(db_pool.clone()))));
    let mut engine = DeliveryEngine::new(storage, config.to_delivery_config(), clock.clone())
        .context("failed to build delivery engine")?;
    engine.start().await.context("failed to start delivery engine")?;

    let state = AppState::new(engine.services(), clock);
    if let Err(e) =
        courier_api::start_server(state, addr, Duration::from_secs(config.request_timeout)).await
    {
        error!(error = %e, "server failed");
    }

    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "delivery engine did not shut down cleanly");
    }

    db_pool.close().await;
    info!("database connections closed");

    info!("courier shutdown complete");
    Ok(())
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured
/// filter.
fn init_tracing(config: &Config) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.rust_log))
        .context("invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Creates the database connection pool, retrying while the database comes
/// up.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(config.database_idle_timeout))
            .max_lifetime(Duration::from_secs(config.database_max_lifetime))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("failed to verify database connection")?;
                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Creates tables and indexes if they do not exist.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    let statements = [
        r"
        CREATE TABLE IF NOT EXISTS endpoints (
            id UUID PRIMARY KEY,
            tenant_id UUID NOT NULL,
            name TEXT NOT NULL,
            url TEXT NOT NULL,
            description TEXT,
            secret TEXT NOT NULL,
            event_types TEXT[] NOT NULL,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            headers JSONB NOT NULL DEFAULT '{}'::jsonb,
            max_retries INTEGER NOT NULL,
            retry_delay_seconds INTEGER NOT NULL,
            total_deliveries BIGINT NOT NULL DEFAULT 0,
            successful_deliveries BIGINT NOT NULL DEFAULT 0,
            failed_deliveries BIGINT NOT NULL DEFAULT 0,
            last_triggered_at TIMESTAMPTZ,
            last_success_at TIMESTAMPTZ,
            last_failure_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            deleted_at TIMESTAMPTZ
        )
        ",
        r"
        CREATE INDEX IF NOT EXISTS idx_endpoints_tenant
            ON endpoints (tenant_id) WHERE deleted_at IS NULL
        ",
        r"
        CREATE TABLE IF NOT EXISTS events (
            id UUID PRIMARY KEY,
            tenant_id UUID NOT NULL,
            event_type TEXT NOT NULL,
            payload JSONB NOT NULL,
            origin_model TEXT,
            origin_id TEXT,
            status TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            claimed_at TIMESTAMPTZ,
            processed_at TIMESTAMPTZ
        )
        ",
        r"
        CREATE INDEX IF NOT EXISTS idx_events_claimable
            ON events (created_at) WHERE status IN ('pending', 'processing')
        ",
        r"
        CREATE INDEX IF NOT EXISTS idx_events_tenant_created
            ON events (tenant_id, created_at)
        ",
        r"
        CREATE TABLE IF NOT EXISTS delivery_attempts (
            id UUID PRIMARY KEY,
            event_id UUID NOT NULL REFERENCES events(id),
            endpoint_id UUID NOT NULL REFERENCES endpoints(id),
            attempt_number INTEGER NOT NULL,
            attempt_trigger TEXT NOT NULL,
            request_url TEXT NOT NULL,
            request_headers JSONB NOT NULL,
            request_body BYTEA NOT NULL,
            response_status INTEGER,
            response_headers JSONB,
            response_body TEXT,
            duration_ms BIGINT,
            succeeded BOOLEAN NOT NULL DEFAULT FALSE,
            error_message TEXT,
            next_retry_at TIMESTAMPTZ,
            retry_claimed_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL,
            completed_at TIMESTAMPTZ,
            UNIQUE (event_id, endpoint_id, attempt_number)
        )
        ",
        r"
        CREATE INDEX IF NOT EXISTS idx_attempts_due_retry
            ON delivery_attempts (next_retry_at) WHERE next_retry_at IS NOT NULL
        ",
        r"
        CREATE INDEX IF NOT EXISTS idx_attempts_endpoint_created
            ON delivery_attempts (endpoint_id, created_at DESC)
        ",
        r"
        CREATE INDEX IF NOT EXISTS idx_attempts_in_flight
            ON delivery_attempts (created_at) WHERE completed_at IS NULL
        ",
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await.context("failed to apply schema")?;
    }
    Ok(())
}
