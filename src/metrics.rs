use prometheus::{Encoder, TextEncoder, HistogramVec, IntCounterVec, GaugeVec, Opts, Registry};
use warp::Filter;
use std::net::SocketAddr;
use once_cell::sync::{Lazy, OnceCell};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// Only set when latency history is enabled
static RTT_HIST: OnceCell<HistogramVec> = OnceCell::new();

static RTT_GAUGE: Lazy<GaugeVec> = Lazy::new(|| {
    let opts = Opts::new("ping_rtt_milliseconds_current", "Round-trip time of the latest echo reply in milliseconds");
    let gauge = GaugeVec::new(opts, &["target"]).expect("valid gauge");
    REGISTRY.register(Box::new(gauge.clone())).expect("gauge registered once");
    gauge
});

fn counter(name: &str, help: &str) -> IntCounterVec {
    let ctr = IntCounterVec::new(Opts::new(name, help), &["target"]).expect("valid counter");
    REGISTRY.register(Box::new(ctr.clone())).expect("counter registered once");
    ctr
}

static REQUESTS: Lazy<IntCounterVec> =
    Lazy::new(|| counter("ping_echo_requests_total", "Echo requests sent"));
static REPLIES: Lazy<IntCounterVec> =
    Lazy::new(|| counter("ping_echo_replies_total", "Echo replies received"));
static SEND_FAILURES: Lazy<IntCounterVec> =
    Lazy::new(|| counter("ping_send_failures_total", "Echo requests that could not be sent"));
static UNEXPECTED: Lazy<IntCounterVec> =
    Lazy::new(|| counter("ping_unexpected_packets_total", "Datagrams that were not our echo replies"));

pub fn initialize_metrics(enable_latency_history: bool) {
    if !enable_latency_history {
        return;
    }
    let opts = Opts::new("ping_rtt_milliseconds", "Echo round-trip time in milliseconds");
    let hist = HistogramVec::new(
        prometheus::HistogramOpts {
            common_opts: opts,
            buckets: vec![
                0.05, 0.1, 0.2, 0.5, 1.0,
                2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 250.0, 500.0, 1000.0
            ],
        },
        &["target"],
    );
    match hist {
        Ok(hist) => {
            if let Err(e) = REGISTRY.register(Box::new(hist.clone())) {
                tracing::error!("could not register RTT histogram: {}", e);
                return;
            }
            let _ = RTT_HIST.set(hist);
        }
        Err(e) => tracing::error!("could not create RTT histogram: {}", e),
    }
}

pub async fn serve_metrics(addr: SocketAddr) {
    let metrics_route = warp::path!("metrics").map(move || {
        let encoder = TextEncoder::new();
        let mf = REGISTRY.gather();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&mf, &mut buf) {
            tracing::error!("could not encode metrics: {}", e);
        }
        warp::http::Response::builder()
            .header("Content-Type", encoder.format_type())
            .body(buf)
            .expect("static response headers are valid")
    });

    warp::serve(metrics_route).run(addr).await;
}

pub fn record_sent(target: &str) {
    REQUESTS.with_label_values(&[target]).inc();
}

pub fn record_send_failure(target: &str) {
    SEND_FAILURES.with_label_values(&[target]).inc();
}

pub fn record_unexpected(target: &str) {
    UNEXPECTED.with_label_values(&[target]).inc();
}

pub fn record_reply(target: &str, rtt_ms: Option<f64>) {
    REPLIES.with_label_values(&[target]).inc();
    let Some(rtt_ms) = rtt_ms else {
        return;
    };
    RTT_GAUGE.with_label_values(&[target]).set(rtt_ms);
    if let Some(hist) = RTT_HIST.get() {
        hist.with_label_values(&[target]).observe(rtt_ms);
    }
}
