use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use ffado_perf::temp_ring_name;
use ffado_ring::{Blocking, Direction, RingBuffer, RingConfig, Role};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SLOTS: u32 = 64;
const BLOCK: u32 = 256;

fn spawn_ring_pair(name: &str) -> (Arc<RingBuffer>, Arc<RingBuffer>) {
    let master = RingBuffer::new(
        RingConfig::new(name, Role::Master, Direction::Outward, Blocking::Blocking, SLOTS, BLOCK)
            .with_queue_timeout(Duration::from_millis(200)),
    )
    .expect("failed to create master endpoint");
    let slave = RingBuffer::new(
        RingConfig::new(name, Role::Slave, Direction::Inward, Blocking::Blocking, SLOTS, BLOCK)
            .with_queue_timeout(Duration::from_millis(200)),
    )
    .expect("failed to open slave endpoint");
    (master, slave)
}

fn bench_write_commit(c: &mut Criterion) {
    let name = temp_ring_name("write_commit");
    let (master, slave) = spawn_ring_pair(&name);

    let stop = Arc::new(AtomicBool::new(false));
    let reader = std::thread::spawn({
        let slave = Arc::clone(&slave);
        let stop = Arc::clone(&stop);
        move || {
            let mut buf = [0u8; BLOCK as usize];
            while !stop.load(Ordering::Relaxed) {
                let _ = slave.read(&mut buf);
            }
        }
    });

    let payload = [0u8; BLOCK as usize];
    let mut group = c.benchmark_group("ring");
    group.throughput(Throughput::Elements(1));
    group.bench_function("write_commit", |b| {
        b.iter(|| master.write(black_box(&payload)).unwrap());
    });
    group.finish();

    stop.store(true, Ordering::Relaxed);
    let _ = master.write(&payload);
    reader.join().unwrap();
}

fn bench_round_trip(c: &mut Criterion) {
    let name = temp_ring_name("round_trip");
    let (master, slave) = spawn_ring_pair(&name);
    let payload = [0u8; BLOCK as usize];
    let mut buf = [0u8; BLOCK as usize];

    let mut group = c.benchmark_group("ring");
    group.throughput(Throughput::Elements(1));
    group.bench_function("round_trip", |b| {
        b.iter(|| {
            master.write(black_box(&payload)).unwrap();
            slave.read(black_box(&mut buf)).unwrap();
        });
    });
    group.finish();
}

fn bench_non_blocking_again(c: &mut Criterion) {
    let name = temp_ring_name("again");
    let master = RingBuffer::new(RingConfig::new(
        name.clone(),
        Role::Master,
        Direction::Outward,
        Blocking::NonBlocking,
        SLOTS,
        BLOCK,
    ))
    .unwrap();
    let _slave = RingBuffer::new(RingConfig::new(
        name,
        Role::Slave,
        Direction::Inward,
        Blocking::NonBlocking,
        SLOTS,
        BLOCK,
    ))
    .unwrap();
    let payload = [0u8; BLOCK as usize];
    for _ in 0..SLOTS {
        master.write(&payload).ok();
    }

    let mut group = c.benchmark_group("ring");
    group.throughput(Throughput::Elements(1));
    group.bench_function("reserve_write_again", |b| {
        b.iter(|| black_box(master.reserve_write()).is_err());
    });
    group.finish();
}

criterion_group!(benches, bench_write_commit, bench_round_trip, bench_non_blocking_again);
criterion_main!(benches);
