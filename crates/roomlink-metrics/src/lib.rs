//! ---
//! rl_section: "01-core-functionality"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Metrics collection and export utilities."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain"),
                )],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Address the exporter actually bound.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone, Debug)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    tick_overruns_total: IntCounter,
    build_info: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "roomlinkd_starts_total",
            "Total number of times the roomlink daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "roomlinkd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let tick_overruns_total = IntCounter::with_opts(Opts::new(
            "roomlinkd_tick_overruns_total",
            "Controller ticks that took longer than the configured tick period",
        ))?;
        registry.register(Box::new(tick_overruns_total.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new(
                "roomlinkd_build_info",
                "Build metadata for the running daemon binary",
            ),
            &["version", "profile"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
            tick_overruns_total,
            build_info,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn inc_tick_overrun(&self) {
        self.tick_overruns_total.inc();
    }

    pub fn set_build_info(&self, version: &str, profile: &str) {
        self.build_info
            .with_label_values(&[version, profile])
            .set(1.0);
    }
}

/// Bus exchange and transfer counters maintained by the protocol controller.
#[derive(Clone, Debug)]
pub struct ProtocolMetrics {
    registry: SharedRegistry,
    exchanges: IntCounterVec,
    exchange_failures: IntCounterVec,
    transfer_chunks: IntCounterVec,
    transfers: IntCounterVec,
    log_records_pulled: IntCounter,
    units_unreachable: IntGauge,
}

impl ProtocolMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let exchanges = IntCounterVec::new(
            Opts::new(
                "roomlink_exchanges_total",
                "Completed bus exchanges by purpose and outcome",
            ),
            &["purpose", "outcome"],
        )?;
        registry.register(Box::new(exchanges.clone()))?;

        let exchange_failures = IntCounterVec::new(
            Opts::new(
                "roomlink_exchange_failures_total",
                "Individual failed attempts (timeout, NAK, bad frame) by purpose",
            ),
            &["purpose"],
        )?;
        registry.register(Box::new(exchange_failures.clone()))?;

        let transfer_chunks = IntCounterVec::new(
            Opts::new(
                "roomlink_transfer_chunks_total",
                "Transfer chunks acknowledged by the receiving unit",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(transfer_chunks.clone()))?;

        let transfers = IntCounterVec::new(
            Opts::new(
                "roomlink_transfers_total",
                "Finished or abandoned transfers by kind and outcome",
            ),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(transfers.clone()))?;

        let log_records_pulled = IntCounter::with_opts(Opts::new(
            "roomlink_log_records_pulled_total",
            "Log records pulled from units into the master log",
        ))?;
        registry.register(Box::new(log_records_pulled.clone()))?;

        let units_unreachable = IntGauge::with_opts(Opts::new(
            "roomlink_units_unreachable",
            "Units whose last status poll exhausted its attempts",
        ))?;
        registry.register(Box::new(units_unreachable.clone()))?;

        Ok(Self {
            registry,
            exchanges,
            exchange_failures,
            transfer_chunks,
            transfers,
            log_records_pulled,
            units_unreachable,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_exchange(&self, purpose: &str, outcome: &str) {
        self.exchanges.with_label_values(&[purpose, outcome]).inc();
    }

    pub fn record_failure(&self, purpose: &str) {
        self.exchange_failures.with_label_values(&[purpose]).inc();
    }

    pub fn record_chunk(&self, kind: &str) {
        self.transfer_chunks.with_label_values(&[kind]).inc();
    }

    pub fn record_transfer(&self, kind: &str, outcome: &str) {
        self.transfers.with_label_values(&[kind, outcome]).inc();
    }

    pub fn add_log_records(&self, count: usize) {
        self.log_records_pulled.inc_by(count as u64);
    }

    pub fn set_unreachable(&self, count: usize) {
        self.units_unreachable.set(count as i64);
    }
}

pub use prometheus;
