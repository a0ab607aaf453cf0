use criterion::{criterion_group, criterion_main, Criterion};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use reftable::{BytesBlockSource, RefRecord, RefValue, Table, TableBuilder, WriteOptions};

fn build_table(refs: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut builder = TableBuilder::new(
        &mut out,
        WriteOptions {
            min_update_index: 1,
            max_update_index: 1,
            ..Default::default()
        },
    )
    .unwrap();
    for i in 0..refs {
        builder
            .add_ref(&RefRecord {
                ref_name: format!("refs/heads/branch-{i:06}"),
                update_index: 1,
                value: RefValue::Direct(vec![(i % 251) as u8; 20]),
            })
            .unwrap();
    }
    builder.finish().unwrap();
    out
}

fn write_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("write");
    for refs in [1_000, 10_000] {
        group.bench_function(format!("{refs} refs"), |b| b.iter(|| build_table(refs)));
    }
}

fn seek_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("seek");
    for refs in [1_000usize, 100_000] {
        group.bench_with_input(format!("{refs} refs"), &refs, |b, &refs| {
            let table = Table::open(BytesBlockSource::new(build_table(refs)), "bench").unwrap();
            let mut rng = SmallRng::from_seed([0; 32]);
            b.iter(|| {
                let name = format!("refs/heads/branch-{:06}", rng.gen_range(0..refs));
                table
                    .seek_ref(&name)
                    .unwrap()
                    .next()
                    .transpose()
                    .unwrap()
                    .unwrap();
            })
        });
    }
}

criterion_group!(benches, write_bench, seek_bench);
criterion_main!(benches);
