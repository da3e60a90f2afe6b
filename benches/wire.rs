// ABOUTME: Benchmark suite for the wire layer: framing, value codec, reassembly
// ABOUTME: Measures encode/decode throughput and chunked packet reassembly

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use granite_net::reassembler::PacketReassembler;
use granite_net::{Opcode, TransferIn, TransferOut, Value};
use std::time::Duration;

fn sample_row() -> Vec<Value> {
    vec![
        Value::Int(42),
        Value::Long(1 << 40),
        Value::String("a fairly ordinary row value".to_string()),
        Value::Decimal("12345.6789".to_string()),
        Value::Bytes(vec![0xAB; 64]),
        Value::Null,
    ]
}

fn encode_query_response() -> Bytes {
    let row = sample_row();
    let mut out = TransferOut::response(Opcode::CommandQuery);
    out.write_i32(1); // status
    out.write_i32(11);
    out.write_i32(row.len() as i32);
    out.write_i32(50);
    for _ in 0..50 {
        out.write_bool(true);
        for value in &row {
            out.write_value(value, None);
        }
    }
    out.write_bool(false);
    out.finish()
}

fn bench_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("query_response_50_rows", |b| {
        b.iter(|| black_box(encode_query_response()));
    });

    group.bench_function("update_request", |b| {
        b.iter(|| {
            let mut out = TransferOut::request(Opcode::CommandUpdate);
            out.write_i32(7);
            out.write_i32(1);
            out.write_string(Some("UPDATE t SET v = v + 1 WHERE k = 42"));
            black_box(out.finish())
        });
    });

    group.finish();
}

fn bench_decoding(c: &mut Criterion) {
    let frame = encode_query_response();
    let payload = frame.slice(4..);

    c.bench_function("decode/query_response_50_rows", |b| {
        b.iter(|| {
            let mut t = TransferIn::new(&payload);
            t.read_i32().unwrap();
            t.read_i32().unwrap();
            t.read_i32().unwrap();
            let columns = t.read_i32().unwrap();
            t.read_i32().unwrap();
            while t.read_bool().unwrap() {
                for _ in 0..columns {
                    black_box(t.read_value(None).unwrap());
                }
            }
        });
    });
}

fn bench_reassembly(c: &mut Criterion) {
    let frame = encode_query_response();
    let mut stream = Vec::new();
    for _ in 0..16 {
        stream.extend_from_slice(&frame);
    }

    let mut group = c.benchmark_group("reassemble");
    for chunk_size in [64usize, 1024, 16 * 1024] {
        group.bench_with_input(
            BenchmarkId::from_parameter(chunk_size),
            &chunk_size,
            |b, &chunk_size| {
                b.iter(|| {
                    let mut r = PacketReassembler::new();
                    let mut total = 0;
                    for chunk in stream.chunks(chunk_size) {
                        total += r.feed(chunk).unwrap().len();
                    }
                    assert_eq!(total, 16);
                    black_box(total)
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_encoding, bench_decoding, bench_reassembly);
criterion_main!(benches);
