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
        Role::Slave,
        Direction::Inward,
        config.blocking_mode(),
        config.slot_count,
        config.block_size,
    )
    .with_queue_timeout(config.queue_timeout());

    let ring = RingBuffer::new(ring_config)
        .expect("failed to attach to ring buffer (start ffado-stream-master first)");
    info!(name = %ring.config().name, "FFADO-STREAM-SLAVE: attached");

    let mut block = vec![0u8; ring.config().block_size as usize];
    let mut last_report = Instant::now();
    let mut read_since_report: u64 = 0;
    let mut last_seq: u64 = 0;

    loop {
        match ring.read(&mut block) {
            Ok(()) => {
                if let Some(payload) = block.get(..8).and_then(|b| b.try_into().ok()) {
                    last_seq = u64::from_le_bytes(payload);
                }
                read_since_report += 1;
            }
            Err(ffado_ring::RingError::Again) => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(err) => {
                tracing::error!(%err, "read failed");
                std::thread::sleep(Duration::from_millis(50));
            }
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            info!(read = read_since_report, last_seq, "FFADO-STREAM-SLAVE: rate");
            read_since_report = 0;
            last_report = Instant::now();
        }
    }
}
