//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain reachability, head and indexed level
//! - Transaction submission, failures, aborts and confirmations
//! - Spool cycles and reorgs
//! - Account balances

use crate::error::{RelayerError, RelayerResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "dapp_relayer_chain_connected",
        "Chain reachability (1=reachable, 0=unreachable)",
        &["chain_id"]
    ).expect("metric registration");

    pub static ref CHAIN_HEAD: GaugeVec = register_gauge_vec!(
        "dapp_relayer_chain_head",
        "Last seen head level per chain",
        &["chain_id"]
    ).expect("metric registration");

    pub static ref CHAIN_INDEX_LEVEL: GaugeVec = register_gauge_vec!(
        "dapp_relayer_chain_index_level",
        "Highest indexed level per chain",
        &["chain_id"]
    ).expect("metric registration");

    pub static ref CHAIN_REORGS: CounterVec = register_counter_vec!(
        "dapp_relayer_chain_reorgs_total",
        "Total reorganizations detected",
        &["chain_id"]
    ).expect("metric registration");

    // Spooler metrics
    pub static ref SPOOL_CYCLES: CounterVec = register_counter_vec!(
        "dapp_relayer_spool_cycles_total",
        "Total spool cycles by outcome",
        &["chain_id", "outcome"]
    ).expect("metric registration");

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "dapp_relayer_transactions_submitted_total",
        "Total transactions submitted",
        &["chain_id"]
    ).expect("metric registration");

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "dapp_relayer_transactions_failed_total",
        "Total failed submission attempts",
        &["chain_id"]
    ).expect("metric registration");

    pub static ref TX_ABORTED: CounterVec = register_counter_vec!(
        "dapp_relayer_transactions_aborted_total",
        "Total transactions aborted",
        &["chain_id"]
    ).expect("metric registration");

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "dapp_relayer_transactions_confirmed_total",
        "Total transactions indexed as done",
        &["chain_id"]
    ).expect("metric registration");

    pub static ref TX_LATENCY: HistogramVec = register_histogram_vec!(
        "dapp_relayer_submission_latency_seconds",
        "Submission round trip latency",
        &["chain_id"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).expect("metric registration");

    // Account metrics
    pub static ref ACCOUNT_BALANCE: GaugeVec = register_gauge_vec!(
        "dapp_relayer_account_balance",
        "Last known account balance",
        &["chain_id", "address"]
    ).expect("metric registration");
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayerError::Config(format!("cannot bind metrics on {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("metrics server stopped: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    render().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))
}

/// Text exposition of every registered metric
pub fn render() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| e.to_string())?;
    String::from_utf8(buffer).map_err(|e| e.to_string())
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_head(chain_id: u64, level: u64) {
    CHAIN_HEAD
        .with_label_values(&[&chain_id.to_string()])
        .set(level as f64);
}

pub fn record_index_level(chain_id: u64, level: u64) {
    CHAIN_INDEX_LEVEL
        .with_label_values(&[&chain_id.to_string()])
        .set(level as f64);
}

pub fn record_reorg(chain_id: u64) {
    CHAIN_REORGS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_spool_cycle(chain_id: u64, outcome: &str) {
    SPOOL_CYCLES
        .with_label_values(&[&chain_id.to_string(), outcome])
        .inc();
}

pub fn record_tx_submitted(chain_id: u64) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_failed(chain_id: u64) {
    TX_FAILED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_aborted(chain_id: u64) {
    TX_ABORTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_confirmed(chain_id: u64) {
    TX_CONFIRMED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_latency(chain_id: u64, latency_secs: f64) {
    TX_LATENCY
        .with_label_values(&[&chain_id.to_string()])
        .observe(latency_secs);
}

pub fn record_account_balance(chain_id: u64, address: &str, balance: Decimal) {
    ACCOUNT_BALANCE
        .with_label_values(&[&chain_id.to_string(), address])
        .set(balance.to_f64().unwrap_or_default());
}
