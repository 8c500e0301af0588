// benches/placement.rs
use std::path::PathBuf;
use std::sync::Arc;

use blitzbackup::common::{FileKind, FileMetadata};
use blitzbackup::compose::Placement;
use blitzbackup::weight::SizeWeight;
use blitzbackup::ComposeFileInfo;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{Rng, SeedableRng};

fn files(n: usize) -> Vec<ComposeFileInfo> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    (0..n)
        .map(|i| {
            let size = rng.gen_range(1..=1 << 30);
            let mut header = tar::Header::new_gnu();
            header.set_size(size);
            let mut info = ComposeFileInfo::new(
                PathBuf::from(format!("/data/base/1/{i}")),
                format!("base/1/{i}"),
                FileMetadata { size, mode: 0o600, mtime: 0, kind: FileKind::Regular },
                false,
                false,
                header,
            );
            info.was_in_base = i % 3 == 0;
            info
        })
        .collect()
}

fn bench_placement(c: &mut Criterion) {
    let input = files(100_000);
    let mut group = c.benchmark_group("placement");
    for streams in [4usize, 16, 64] {
        group.bench_with_input(BenchmarkId::new("round_robin", streams), &streams, |b, &n| {
            b.iter(|| {
                let mut p = Placement::round_robin(n);
                for f in &input {
                    black_box(p.place(f));
                }
            })
        });
        group.bench_with_input(BenchmarkId::new("weight_balanced", streams), &streams, |b, &n| {
            b.iter(|| {
                let mut p = Placement::weight_balanced(n, Arc::new(SizeWeight));
                for f in &input {
                    black_box(p.place(f));
                }
            })
        });
        group.bench_with_input(BenchmarkId::new("ancestor_copy", streams), &streams, |b, &n| {
            b.iter(|| {
                let mut p = Placement::ancestor_copy(n, Arc::new(SizeWeight));
                for f in &input {
                    black_box(p.place(f));
                }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_placement);
criterion_main!(benches);
