use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use lithos_events::{Event, EventKind, TopOfBook};
use lithos_icc::frame::{self, FrameHeader, FrameTime};
use lithos_icc::{RecordType, RingOptions};
use lithos_perf::{channel_pair, make_test_tob};

const TOP_OF_BOOK: RecordType = RecordType(EventKind::TopOfBook.code());

fn bench_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame");
    group.throughput(Throughput::Elements(1));

    let payload = make_test_tob().encode();
    let header = FrameHeader {
        seq_no: 42,
        record_type: TOP_OF_BOOK,
        partition: None,
        time: FrameTime::Delta(1_250),
        length: payload.len() as u32,
    };
    let mut buf = vec![0u8; header.frame_len()];

    group.bench_function("encode (delta)", |b| {
        b.iter(|| {
            black_box(&header)
                .encode_into(&mut buf)
                .copy_from_slice(&payload);
        });
    });
    group.bench_function("decode", |b| {
        b.iter(|| black_box(frame::decode(black_box(&buf)).unwrap()));
    });
    group.finish();
}

fn bench_publish(c: &mut Criterion) {
    let (mut publisher, mut sub) = channel_pair(RingOptions::new(1 << 16));
    let tob = make_test_tob();

    let mut group = c.benchmark_group("channel");
    group.throughput(Throughput::Elements(1));

    group.bench_function("publish_with (zero copy)", |b| {
        b.iter(|| {
            publisher
                .publish_with(TOP_OF_BOOK, TopOfBook::WIRE_LEN, None, |buf| {
                    buf.copy_from_slice(&black_box(tob).encode())
                })
                .unwrap();
            while sub.next_record().unwrap().is_some() {
                sub.release().unwrap();
            }
        });
    });

    group.bench_function("publish + next_record + decode", |b| {
        b.iter(|| {
            publisher
                .publish(TOP_OF_BOOK, &black_box(tob).encode(), None)
                .unwrap();
            let r = sub.next_record().unwrap().unwrap();
            black_box(Event::decode(r.record_type.0, r.payload));
            sub.release().unwrap();
        });
    });

    group.bench_function("heartbeat", |b| {
        b.iter(|| {
            publisher.heartbeat().unwrap();
            black_box(sub.next_record().unwrap());
        });
    });
    group.finish();
}

criterion_group!(benches, bench_frame, bench_publish);
criterion_main!(benches);
