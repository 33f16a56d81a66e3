use ffado_config::FfadoConfig;
use ffado_ring::{Direction, RingBuffer, RingConfig, Role};
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/ffado/stream.toml".to_string());
    let config = FfadoConfig::load(config_path).unwrap_or_else(|err| {
        tracing::warn!(%err, "falling back to default config");
        toml::from_str("").unwrap()
    });

    let ring_config = RingConfig::new(
        config.name.clone(),
        Role::Master,
        Direction::Outward,
        config.blocking_mode(),
        config.slot_count,
        config.block_size,
    )
    .with_queue_timeout(config.queue_timeout());

    let ring = RingBuffer::new(ring_config).expect("failed to create ring buffer");
    info!(
        name = %ring.config().name,
        slots = ring.config().slots,
        block_size = ring.config().block_size,
        "FFADO-STREAM-MASTER: streaming"
    );

    let mut seq: u64 = 0;
    let mut last_report = Instant::now();
    let mut written_since_report: u64 = 0;

    loop {
        let payload = seq.to_le_bytes();
        let mut block = vec![0u8; ring.config().block_size as usize];
        block[..payload.len().min(block.len())]
            .copy_from_slice(&payload[..payload.len().min(block.len())]);

        match ring.write(&block) {
            Ok(()) => {
                seq += 1;
                written_since_report += 1;
            }
            Err(ffado_ring::RingError::Again) => {
                tracing::debug!("ring full, backing off");
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(err) => {
                tracing::error!(%err, "write failed");
                std::thread::sleep(Duration::from_millis(50));
            }
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            info!(written = written_since_report, fill = ring.buffer_fill(), "FFADO-STREAM-MASTER: rate");
            written_since_report = 0;
            last_report = Instant::now();
        }
    }
}
