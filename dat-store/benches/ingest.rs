use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dat_store::{
    formats::Input,
    ingest::{self, PipelineOptions},
    Store,
};
use tokio::runtime::Runtime;

fn csv_rows(n: u64) -> String {
    let mut s = String::from("name,age,city\n");
    for i in 0..n {
        s.push_str(&format!("user-{i},{},city-{}\n", i % 90, i % 17));
    }
    s
}

fn ndjson_rows(n: u64) -> String {
    let mut s = String::new();
    for i in 0..n {
        s.push_str(&format!(
            "{{\"name\":\"user-{i}\",\"age\":{},\"city\":\"city-{}\"}}\n",
            i % 90,
            i % 17
        ));
    }
    s
}

fn benchmark_ingest(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("ingest");
    group.sample_size(10);
    for rows in [100_u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(rows));
        let csv = csv_rows(rows);
        let ndjson = ndjson_rows(rows);
        group.bench_with_input(BenchmarkId::new("csv", rows), &csv, |b, csv| {
            b.to_async(&rt).iter(|| async {
                let store = Store::in_memory().unwrap();
                let input = Input::csv(std::io::Cursor::new(csv.clone().into_bytes()), b',');
                let options = PipelineOptions {
                    primary: "name".into(),
                    ..Default::default()
                };
                ingest::spawn(store, input, options).collect().await.unwrap()
            });
        });
        group.bench_with_input(BenchmarkId::new("ndjson", rows), &ndjson, |b, ndjson| {
            b.to_async(&rt).iter(|| async {
                let store = Store::in_memory().unwrap();
                let input = Input::ndjson(std::io::Cursor::new(ndjson.clone().into_bytes()));
                let options = PipelineOptions {
                    primary: "name".into(),
                    ..Default::default()
                };
                ingest::spawn(store, input, options).collect().await.unwrap()
            });
        });
    }
}

criterion_group!(benches, benchmark_ingest);
criterion_main!(benches);
