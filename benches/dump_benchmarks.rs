//! Benchmarks for the per-exchange hot path: buffering bodies and rendering dumps

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hyper::{Request, Response, StatusCode};
use std::time::Duration;
use tokio::runtime::Runtime;
use wiretap_proxy::body::{full_body, DuplicatedBody};
use wiretap_proxy::dump::{self, Direction, DumpSink, ExchangeRecord};

fn payload(size: usize) -> Bytes {
    Bytes::from(vec![b'x'; size])
}

/// Benchmark draining a body and replaying it
fn bench_duplicate_body(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("duplicate_body");

    for size in [256usize, 16 * 1024, 1024 * 1024] {
        let bytes = payload(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &bytes, |b, bytes| {
            b.iter(|| {
                rt.block_on(async {
                    let body = DuplicatedBody::drain(full_body(bytes.clone())).await.unwrap();
                    black_box(body.stream());
                    black_box(body.stream());
                })
            });
        });
    }

    group.finish();
}

/// Benchmark rendering the outbound request and inbound response
fn bench_render(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("render");
    let body = payload(4 * 1024);

    group.bench_function("request_out", |b| {
        b.iter(|| {
            let req = Request::builder()
                .method("POST")
                .uri("https://backend.example.com/svc?wsdl")
                .header("host", "backend.example.com")
                .header("content-type", "text/xml; charset=utf-8")
                .header("soapaction", "\"urn:ping\"")
                .body(full_body(body.clone()))
                .unwrap();
            black_box(rt.block_on(dump::render_request_out(req)).unwrap());
        });
    });

    group.bench_function("response", |b| {
        b.iter(|| {
            let resp = Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/xml")
                .body(full_body(body.clone()))
                .unwrap();
            black_box(rt.block_on(dump::render_response(resp)).unwrap());
        });
    });

    group.finish();
}

/// Benchmark framing a record into the sink
fn bench_emit(c: &mut Criterion) {
    let sink = DumpSink::from_writer(std::io::sink(), true);
    let record = ExchangeRecord::new(Direction::InboundResponse, payload(4 * 1024).to_vec())
        .with_elapsed(Duration::from_millis(42));

    c.bench_function("emit", |b| {
        b.iter(|| {
            sink.emit(black_box(&record)).unwrap();
        });
    });
}

criterion_group!(benches, bench_duplicate_body, bench_render, bench_emit);
criterion_main!(benches);
