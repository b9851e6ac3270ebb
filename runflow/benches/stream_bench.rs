//! Benchmarks for data-stream fan-out.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use runflow::stream::{bytes_reader, read_all, DataStream};

fn fan_out(payload: &[u8], copies: usize) -> usize {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let stream = DataStream::new("stdin");
        stream.merge_with(bytes_reader(payload.to_vec()));
        let readers: Vec<_> = (0..copies).filter_map(|_| stream.copy()).collect();
        stream.close();

        let mut total = 0;
        for reader in readers {
            total += read_all(reader).await.unwrap().len();
        }
        stream.wait().await;
        total
    })
}

fn stream_benchmark(c: &mut Criterion) {
    let payload = vec![b'x'; 64 * 1024];
    let mut group = c.benchmark_group("copy_fan_out");
    for copies in [1, 4, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(copies), &copies, |b, &copies| {
            b.iter(|| black_box(fan_out(&payload, copies)));
        });
    }
    group.finish();
}

criterion_group!(benches, stream_benchmark);
criterion_main!(benches);
