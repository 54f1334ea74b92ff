//! FAT ledger daemon
//!
//! Opens every chain store, audits it, and serves Prometheus metrics until
//! interrupted. Usage: `fat-ledgerd [config.toml]`. Without a file the
//! configuration comes from `FAT_LEDGER_*` environment variables.

use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use anyhow::Context;
use fat_ledger::{config::LogConfig, metrics::Metrics, Config, Ledger};
use tracing_subscriber::EnvFilter;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => {
            Config::from_file(&path).with_context(|| format!("Failed to load {}", path))?
        }
        None => Config::from_env()?,
    };
    init_tracing(&config.log)?;

    tracing::info!(
        data_dir = ?config.data_dir,
        network = %config.network_id,
        "Starting FAT ledger daemon"
    );

    let ledger = Ledger::open(config.clone()).await?;
    tracing::info!(chains = ledger.chain_ids().len(), "Ledger opened successfully");

    for report in ledger.audit_all()? {
        if !report.passed() {
            tracing::error!(
                chain_id = %report.chain_id,
                violation = ?report.violation,
                "Chain failed integrity audit"
            );
        }
    }

    for chain in ledger.issued_chains()? {
        let stats = ledger.stats(&chain.chain_id)?;
        tracing::info!(
            chain_id = %chain.chain_id,
            token_id = %chain.token_id,
            circulating = stats.circulating,
            burned = stats.burned,
            transactions = stats.tx_count,
            sync_height = stats.sync_height,
            "Token"
        );
    }

    let metrics = ledger.metrics().clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(metrics.clone()))
            .route("/health", web::get().to(health_check))
            .route("/metrics", web::get().to(prometheus_metrics))
    })
    .bind(&config.metrics_listen_addr)
    .with_context(|| format!("Failed to bind {}", config.metrics_listen_addr))?
    .disable_signals()
    .run();
    let server_handle = server.handle();
    tracing::info!(addr = %config.metrics_listen_addr, "Serving metrics");

    tokio::select! {
        result = server => result?,
        result = tokio::signal::ctrl_c() => {
            result?;
            server_handle.stop(true).await;
        }
    }

    tracing::info!("Shutting down FAT ledger daemon");
    ledger.shutdown().await?;
    Ok(())
}

fn init_tracing(config: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .with_context(|| format!("Invalid log filter {:?}", config.filter))?;

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
    Ok(())
}

async fn health_check() -> impl Responder {
    HttpResponse::Ok().body("ok")
}

async fn prometheus_metrics(metrics: web::Data<Metrics>) -> impl Responder {
    match metrics.encode_text() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}
