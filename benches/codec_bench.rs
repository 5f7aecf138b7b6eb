//! Protocol and relay benchmarks.
//!
//! Measures handshake message parsing and the cost of one pump moving a
//! buffer through an in-memory pipe.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use lansocks::proxy::relay::{pump, DEFAULT_BUFFER_SIZE};
use lansocks::proxy::socks5::{
    Address, ConnectReply, ConnectRequest, MethodSelection, Reply, METHOD_NO_AUTH,
};

fn bench_greeting_decode(c: &mut Criterion) {
    let greeting = MethodSelection::new(vec![0x02, 0x01, METHOD_NO_AUTH])
        .encode()
        .unwrap();

    c.bench_function("greeting_decode", |b| {
        b.iter(|| black_box(MethodSelection::decode(black_box(&greeting)).unwrap()))
    });
}

fn bench_request_decode(c: &mut Criterion) {
    let requests = [
        ("ipv4", ConnectRequest::connect(Address::Ipv4([93, 184, 216, 34].into()), 443)),
        ("domain", ConnectRequest::connect(Address::Domain("www.example.com".into()), 443)),
        ("ipv6", ConnectRequest::connect(Address::Ipv6("2001:db8::1".parse().unwrap()), 443)),
    ];

    let mut group = c.benchmark_group("request_decode");
    for (name, request) in requests {
        let encoded = request.encode().unwrap();
        group.bench_function(name, |b| {
            b.iter(|| black_box(ConnectRequest::decode(black_box(&encoded)).unwrap()))
        });
    }
    group.finish();
}

fn bench_reply_encode(c: &mut Criterion) {
    c.bench_function("reply_encode", |b| {
        b.iter(|| black_box(ConnectReply::unspecified(black_box(Reply::Succeeded)).encode().unwrap()))
    });
}

fn bench_pump(c: &mut Criterion) {
    const PAYLOAD: usize = 1024 * 1024;
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let payload = vec![0xA5u8; PAYLOAD];
    let payload = &payload;

    let mut group = c.benchmark_group("pump");
    group.throughput(Throughput::Bytes(PAYLOAD as u64));

    group.bench_function("1mb_duplex", |b| {
        b.to_async(&runtime).iter(|| async move {
            let (mut source, mut reader) = tokio::io::duplex(DEFAULT_BUFFER_SIZE);
            let (mut writer, mut sink) = tokio::io::duplex(DEFAULT_BUFFER_SIZE);
            let cancel = CancellationToken::new();

            let feed = async {
                source.write_all(payload).await.unwrap();
                source.shutdown().await.unwrap();
            };
            let relay = async {
                pump(&mut reader, &mut writer, DEFAULT_BUFFER_SIZE, &cancel, |_| {})
                    .await
                    .unwrap();
                drop(writer);
            };
            let drain = async {
                let mut out = Vec::with_capacity(PAYLOAD);
                sink.read_to_end(&mut out).await.unwrap();
                out.len()
            };

            let (_, _, received) = tokio::join!(feed, relay, drain);
            black_box(received)
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_greeting_decode,
    bench_request_decode,
    bench_reply_encode,
    bench_pump,
);
criterion_main!(benches);
