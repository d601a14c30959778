//! Structured logging setup (SPEC_FULL §2.2).
//!
//! Grounded in the teacher's `tracing` + `tracing-subscriber` (`env-filter`)
//! + `tracing-appender` stack: a `registry()` with an `EnvFilter` layer and
//! a stdout formatting layer, returning the `WorkerGuard` that keeps the
//! non-blocking writer alive for the process lifetime.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter applied when `RUST_LOG`/`CC_LOG` is unset: info-level for
/// this crate, warn for `tower_http`'s access-log spans (which are noisy at
/// info on a busy webhook endpoint).
const DEFAULT_FILTER: &str = "ccbroker=info,tower_http=warn";

/// Initializes the global `tracing` subscriber. The returned [`WorkerGuard`]
/// must be held for the process lifetime (dropping it stops the background
/// flush thread) — callers bind it to a variable in `main` and let it drop
/// on shutdown.
pub fn init_tracing() -> WorkerGuard {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(writer).with_target(true))
        .init();

    guard
}

/// Behind the `metrics` feature: a Prometheus registry exposing the
/// counters/histograms named in SPEC_FULL §10 (connected agent count,
/// queue depth, dispatch latency). Mirrors the teacher's own
/// `[features] metrics = ["dep:prometheus"]` flag, off by default since it
/// changes no core behavior.
#[cfg(feature = "metrics")]
pub mod metrics {
    use prometheus::{Encoder, Histogram, HistogramOpts, IntGauge, Registry, TextEncoder};

    pub struct Metrics {
        pub registry: Registry,
        pub connected_agents: IntGauge,
        pub queue_depth: IntGauge,
        pub dispatch_latency: Histogram,
    }

    impl Metrics {
        pub fn new() -> Self {
            let registry = Registry::new();
            let connected_agents =
                IntGauge::new("ccbroker_connected_agents", "Agents currently live on the gateway").unwrap();
            let queue_depth = IntGauge::new("ccbroker_queue_depth", "QUEUED processed messages across all orgs").unwrap();
            let dispatch_latency = Histogram::with_opts(HistogramOpts::new(
                "ccbroker_dispatch_latency_seconds",
                "Time from chat event ingress to agent dispatch or queueing",
            ))
            .unwrap();

            registry.register(Box::new(connected_agents.clone())).unwrap();
            registry.register(Box::new(queue_depth.clone())).unwrap();
            registry.register(Box::new(dispatch_latency.clone())).unwrap();

            Self { registry, connected_agents, queue_depth, dispatch_latency }
        }

        pub fn render(&self) -> String {
            let metric_families = self.registry.gather();
            let mut buf = Vec::new();
            TextEncoder::new().encode(&metric_families, &mut buf).expect("prometheus text encoding never fails");
            String::from_utf8(buf).expect("prometheus text encoder emits valid utf-8")
        }
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }
}
