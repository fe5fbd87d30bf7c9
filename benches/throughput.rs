use std::time::{Duration, Instant};

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use cbp::{
    crc, Chunker, Config, Engine, MemoryTransport, Reassembly, DEFAULT_CHUNK_PAYLOAD,
    DEFAULT_MTU_SIZE,
};

const WARM_UP_TIME: Duration = Duration::from_millis(300);
const MEASUREMENT_TIME: Duration = Duration::from_millis(1500);

fn payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>())
}

fn bench_crc32(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc32");
    group.warm_up_time(WARM_UP_TIME);
    group.measurement_time(MEASUREMENT_TIME);

    for &len in &[168usize, 4096, 65536] {
        let data = payload(len);
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::new("one_shot", len), &data, |b, data| {
            b.iter(|| crc::compute(black_box(data)))
        });
        group.bench_with_input(BenchmarkId::new("per_chunk", len), &data, |b, data| {
            b.iter(|| {
                let mut hasher = crc::Crc32::new();
                for part in data.chunks(DEFAULT_CHUNK_PAYLOAD) {
                    hasher.update(black_box(part));
                }
                hasher.finalize()
            })
        });
    }

    group.finish();
}

fn bench_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassembly");
    group.warm_up_time(WARM_UP_TIME);
    group.measurement_time(MEASUREMENT_TIME);

    let chunk_size = Config::default().chunk_payload_size;
    for &len in &[4096usize, 65536] {
        let data = payload(len);
        let chunks = Chunker::new(chunk_size).split(&data);
        group.throughput(Throughput::Bytes(len as u64));

        group.bench_with_input(BenchmarkId::new("reverse", len), &chunks, |b, chunks| {
            b.iter(|| {
                let mut reassembly = Reassembly::new(len, chunks.len(), chunk_size).unwrap();
                for chunk in chunks.iter().rev() {
                    reassembly.insert(chunk.header.chunk_num, &chunk.data).unwrap();
                }
                black_box(reassembly.crc32())
            })
        });
    }

    group.finish();
}

fn bench_engine_transfer(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine");
    group.warm_up_time(WARM_UP_TIME);
    group.measurement_time(MEASUREMENT_TIME);
    group.sample_size(20);

    let len = 65536;
    let data = payload(len);
    group.throughput(Throughput::Bytes(len as u64));

    group.bench_function("stop_and_wait_64k", |b| {
        b.iter(|| {
            let (central_transport, mut central_wire) = MemoryTransport::new(DEFAULT_MTU_SIZE);
            let (peripheral_transport, mut peripheral_wire) =
                MemoryTransport::new(DEFAULT_MTU_SIZE);
            let (mut central, _central_events) =
                Engine::new(Config::default(), central_transport).unwrap();
            let (mut peripheral, _peripheral_events) =
                Engine::new(Config::default(), peripheral_transport).unwrap();

            let now = Instant::now();
            central.on_connection_changed(true);
            central.send_data(data.clone(), now).unwrap();

            while central.is_transfer_in_progress() {
                for frame in central_wire.drain_payload() {
                    let _ = peripheral.on_payload_write(&frame, now);
                }
                for frame in peripheral_wire.drain_control() {
                    let _ = central.on_control_write(&frame, now);
                }
            }

            black_box(peripheral.statistics().bytes_received)
        })
    });

    group.finish();
}

criterion_group!(benches, bench_crc32, bench_reassembly, bench_engine_transfer);
criterion_main!(benches);
