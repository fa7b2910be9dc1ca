use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::cache::stats::Stat;
use crate::cache::Cache;

const NAMESPACE: &str = "histcache";

/// Prometheus metrics for cache health.
///
/// All metrics use the "histcache" namespace. Gauges and value counters
/// are refreshed from the cache's lock-free statistics by
/// [`refresh`](Self::refresh); sync counters are fed by the coordinators.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Values accepted into the cache by kind.
    pub values: CounterVec,
    /// Ring slots in use, in bytes.
    pub history_used_bytes: Gauge,
    /// Free share of the ring, in percent.
    pub history_free_percent: Gauge,
    /// Text arena bytes in use.
    pub text_used_bytes: Gauge,
    /// Free share of the text arena, in percent.
    pub text_free_percent: Gauge,
    /// Bytes taken by open trend aggregates.
    pub trend_used_bytes: Gauge,
    /// Items currently held by a sync round.
    pub in_flight_items: Gauge,

    /// Completed sync rounds.
    pub sync_rounds: Counter,
    /// Records persisted by sync rounds.
    pub sync_records: Counter,
    /// Failed sync rounds.
    pub sync_errors: Counter,
    /// Sync round duration (1ms-5s buckets).
    pub sync_round_duration: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let values = CounterVec::new(
            Opts::new("values_total", "Values accepted into the cache by kind.")
                .namespace(NAMESPACE),
            &["kind"],
        )?;
        let history_used_bytes = Gauge::with_opts(
            Opts::new("history_used_bytes", "Ring slots in use, in bytes.").namespace(NAMESPACE),
        )?;
        let history_free_percent = Gauge::with_opts(
            Opts::new("history_free_percent", "Free share of the history ring.")
                .namespace(NAMESPACE),
        )?;
        let text_used_bytes = Gauge::with_opts(
            Opts::new("text_used_bytes", "Text arena bytes in use.").namespace(NAMESPACE),
        )?;
        let text_free_percent = Gauge::with_opts(
            Opts::new("text_free_percent", "Free share of the text arena.").namespace(NAMESPACE),
        )?;
        let trend_used_bytes = Gauge::with_opts(
            Opts::new("trend_used_bytes", "Bytes taken by open trend aggregates.")
                .namespace(NAMESPACE),
        )?;
        let in_flight_items = Gauge::with_opts(
            Opts::new("in_flight_items", "Items currently held by a sync round.")
                .namespace(NAMESPACE),
        )?;
        let sync_rounds = Counter::with_opts(
            Opts::new("sync_rounds_total", "Completed sync rounds.").namespace(NAMESPACE),
        )?;
        let sync_records = Counter::with_opts(
            Opts::new("sync_records_total", "Records persisted by sync rounds.")
                .namespace(NAMESPACE),
        )?;
        let sync_errors = Counter::with_opts(
            Opts::new("sync_errors_total", "Failed sync rounds.").namespace(NAMESPACE),
        )?;
        let sync_round_duration = Histogram::with_opts(
            HistogramOpts::new(
                "sync_round_duration_seconds",
                "Time to persist one drained batch.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        registry.register(Box::new(values.clone()))?;
        registry.register(Box::new(history_used_bytes.clone()))?;
        registry.register(Box::new(history_free_percent.clone()))?;
        registry.register(Box::new(text_used_bytes.clone()))?;
        registry.register(Box::new(text_free_percent.clone()))?;
        registry.register(Box::new(trend_used_bytes.clone()))?;
        registry.register(Box::new(in_flight_items.clone()))?;
        registry.register(Box::new(sync_rounds.clone()))?;
        registry.register(Box::new(sync_records.clone()))?;
        registry.register(Box::new(sync_errors.clone()))?;
        registry.register(Box::new(sync_round_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            values,
            history_used_bytes,
            history_free_percent,
            text_used_bytes,
            text_free_percent,
            trend_used_bytes,
            in_flight_items,
            sync_rounds,
            sync_records,
            sync_errors,
            sync_round_duration,
        })
    }

    /// Copies the cache statistics into the registered metrics.
    pub fn refresh(&self, cache: &Cache) {
        for (kind, stat) in [
            ("float", Stat::HistoryFloatCounter),
            ("uint", Stat::HistoryUintCounter),
            ("str", Stat::HistoryStrCounter),
            ("text", Stat::HistoryTextCounter),
            ("log", Stat::HistoryLogCounter),
            ("notsupported", Stat::NotSupportedCounter),
        ] {
            let counter = self.values.with_label_values(&[kind]);
            let delta = cache.get_stats(stat).as_f64() - counter.get();
            if delta > 0.0 {
                counter.inc_by(delta);
            }
        }

        self.history_used_bytes
            .set(cache.get_stats(Stat::HistoryUsed).as_f64());
        self.history_free_percent
            .set(cache.get_stats(Stat::HistoryPFree).as_f64());
        self.text_used_bytes
            .set(cache.get_stats(Stat::TextUsed).as_f64());
        self.text_free_percent
            .set(cache.get_stats(Stat::TextPFree).as_f64());
        self.trend_used_bytes
            .set(cache.get_stats(Stat::TrendUsed).as_f64());
        self.in_flight_items.set(cache.in_flight() as f64);
    }

    /// Accounts one finished sync round.
    pub fn observe_round(&self, records: usize, elapsed: Duration) {
        self.sync_rounds.inc();
        self.sync_records.inc_by(records as f64);
        self.sync_round_duration.observe(elapsed.as_secs_f64());
    }

    /// Renders the registry in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        render(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz. Returns the
    /// bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn render(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match render(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
