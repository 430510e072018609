use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use lithos_icc::{AttachPoint, OverflowPolicy, RingBuffer, RingOptions};
use lithos_perf::{ring_pair, temp_segment};

const CAPACITY: u64 = 1 << 16;

fn bench_reserve_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring");
    group.throughput(Throughput::Elements(1));

    // No reader attached: every lap reclaims straight away.
    let mut ring = RingBuffer::in_memory(RingOptions::new(CAPACITY)).expect("ring");
    let payload = [7u8; 64];
    group.bench_function("reserve_commit (no readers)", |b| {
        b.iter(|| {
            let buf = ring.reserve(black_box(payload.len())).unwrap();
            buf.copy_from_slice(&payload);
            ring.commit().unwrap();
        });
    });

    let mut ring = RingBuffer::in_memory(
        RingOptions::new(CAPACITY).with_policy(OverflowPolicy::Overwrite),
    )
    .expect("ring");
    let _reader = ring.shadow().attach(AttachPoint::Head).expect("reader");
    group.bench_function("reserve_commit (overwrite, stalled reader)", |b| {
        b.iter(|| {
            let buf = ring.reserve(black_box(payload.len())).unwrap();
            buf.copy_from_slice(&payload);
            ring.commit().unwrap();
        });
    });
    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_round_trip");
    group.throughput(Throughput::Elements(1));

    for &len in &[16usize, 64, 256, 1024] {
        let (mut ring, mut reader) = ring_pair(RingOptions::new(CAPACITY));
        let payload = vec![1u8; len];
        group.bench_with_input(BenchmarkId::new("reject", len), &len, |b, &len| {
            b.iter(|| {
                ring.reserve(len).unwrap().copy_from_slice(&payload);
                ring.commit().unwrap();
                black_box(reader.peek().unwrap());
                reader.release().unwrap();
            });
        });

        let (mut ring, mut reader) =
            ring_pair(RingOptions::new(CAPACITY).with_policy(OverflowPolicy::Overwrite));
        group.bench_with_input(BenchmarkId::new("overwrite", len), &len, |b, &len| {
            b.iter(|| {
                ring.reserve(len).unwrap().copy_from_slice(&payload);
                ring.commit().unwrap();
                black_box(reader.peek().unwrap());
                reader.release().unwrap();
            });
        });
    }
    group.finish();
}

fn bench_named_segment(c: &mut Criterion) {
    let ident = temp_segment("ring_rt");
    let mut ring = RingBuffer::create(&ident, RingOptions::new(CAPACITY)).expect("segment");
    let mut reader = ring
        .shadow()
        .attach(AttachPoint::Head)
        .expect("reader");

    let mut group = c.benchmark_group("ring_round_trip");
    group.throughput(Throughput::Elements(1));
    group.bench_function("named segment 64B", |b| {
        b.iter(|| {
            ring.reserve(64).unwrap().fill(3);
            ring.commit().unwrap();
            black_box(reader.peek().unwrap());
            reader.release().unwrap();
        });
    });
    group.bench_function("peek (empty)", |b| {
        b.iter(|| black_box(reader.peek().unwrap().is_none()));
    });
    group.finish();

    // Dropping the last producer unlinks the segment.
    drop(reader);
    ring.close();
}

criterion_group!(benches, bench_reserve_commit, bench_round_trip, bench_named_segment);
criterion_main!(benches);
