//! Performance benchmarks for the relay hot paths.
//!
//! - Encoding output messages in both wire formats
//! - Broadcasting output chunks through a relay channel to several members

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use protocol::messages::SessionOutput;
use protocol::{OutputOrigin, ServerMessage, SessionKind, WireFormat};
use relay::session::{OutputChunk, RelayChannel, Subscriber};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

fn output(len: usize) -> ServerMessage {
    ServerMessage::Output(SessionOutput {
        session_id: "0123456789abcdef0123456789abcdef".to_string(),
        origin: OutputOrigin::Stdout,
        bytes: vec![b'x'; len],
    })
}

/// Benchmark encoding an output message.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_output");

    for len in [1usize, 4096, 65536] {
        let message = output(len);
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::new("json", len), &message, |b, m| {
            b.iter(|| WireFormat::Json.encode(black_box(m)).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("msgpack", len), &message, |b, m| {
            b.iter(|| WireFormat::MessagePack.encode(black_box(m)).unwrap());
        });
    }

    group.finish();
}

/// Benchmark fanning one chunk out to N members.
fn bench_broadcast(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("channel_broadcast");
    let chunk = OutputChunk {
        origin: OutputOrigin::Stdout,
        bytes: vec![b'x'; 4096],
    };

    for members in [1usize, 4, 16] {
        let channel = runtime.block_on(async {
            let channel =
                RelayChannel::new("bench".to_string(), SessionKind::InteractiveShell, 1024, 0);
            for i in 0..members {
                let (outbound, mut rx) = mpsc::channel(1024);
                tokio::spawn(async move { while rx.recv().await.is_some() {} });
                channel
                    .join(Subscriber {
                        connection_id: format!("c{i}"),
                        user_id: "bench".to_string(),
                        outbound,
                    })
                    .await
                    .unwrap();
            }
            channel
        });

        group.throughput(Throughput::Bytes((chunk.bytes.len() * members) as u64));
        group.bench_function(BenchmarkId::from_parameter(members), |b| {
            b.iter(|| runtime.block_on(channel.broadcast(black_box(chunk.clone()))));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_broadcast);
criterion_main!(benches);
