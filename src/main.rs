mod metrics;

use echo_pinger::{event_channel, PingEngine, PingEvent, PingerConfig};
use tracing::{info, warn, error, debug};

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    // Load config first to get log level
    let config_file = std::env::var("PING_CONFIG")
        .unwrap_or_else(|_| "ping.json".to_string());
    let mut config = PingerConfig::load(&config_file).await?;
    if let Some(host) = std::env::args().nth(1) {
        config.host = host;
    }
    let log_level = config.get_tracing_level()?;

    println!("Starting echo_pinger with config {}", config_file);

    // Init tracing with configured log level
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env()
                         .add_directive(format!("echo_pinger={}", log_level.as_str().to_lowercase()).parse()?))
        .init();

    metrics::initialize_metrics(config.enable_latency_history);
    if let Some(port) = config.metrics_port {
        let metrics_addr = ([0, 0, 0, 0], port).into();
        tokio::spawn(metrics::serve_metrics(metrics_addr));
        info!("metrics on http://{}/metrics", metrics_addr);
    }

    let mut engine = PingEngine::with_config(config.engine_config());
    let (handler, mut events) = event_channel();
    let target = engine.start(&config.host, config.family, handler).await?;
    let label = config.host.as_str();

    let (mut transmitted, mut received) = (0u64, 0u64);
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        tokio::select! {
            _ = &mut interrupted => {
                info!("interrupted");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    PingEvent::SessionStarted(addr) => {
                        info!("PING {} ({}) identifier={:#06x}", config.host, addr, engine.identifier());
                    }
                    PingEvent::PacketSent { packet, sequence } => {
                        transmitted += 1;
                        metrics::record_sent(label);
                        debug!("{} bytes to {}: icmp_seq={}", packet.len(), target, sequence);
                    }
                    PingEvent::SendFailed { sequence, error, .. } => {
                        transmitted += 1;
                        metrics::record_send_failure(label);
                        warn!("icmp_seq={} send failed: {}", sequence, error);
                    }
                    PingEvent::ReplyReceived { packet, sequence, source, rtt } => {
                        received += 1;
                        let rtt_ms = rtt.map(|d| d.as_secs_f64() * 1000.0);
                        metrics::record_reply(label, rtt_ms);
                        match rtt_ms {
                            Some(ms) => info!("{} bytes from {}: icmp_seq={} time={:.3} ms", packet.len(), source, sequence, ms),
                            None => info!("{} bytes from {}: icmp_seq={} (late)", packet.len(), source, sequence),
                        }
                    }
                    PingEvent::UnexpectedPacketReceived(bytes) => {
                        metrics::record_unexpected(label);
                        debug!("ignored {} byte datagram", bytes.len());
                    }
                    PingEvent::Failed(e) => {
                        error!("ping session failed: {}", e);
                        break;
                    }
                }
            }
        }
    }

    engine.stop_and_wait().await;
    let loss = if transmitted == 0 {
        0.0
    } else {
        100.0 * transmitted.saturating_sub(received) as f64 / transmitted as f64
    };
    info!("{} packets transmitted, {} received, {:.1}% packet loss", transmitted, received, loss);
    Ok(())
}
