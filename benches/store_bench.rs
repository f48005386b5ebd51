//! Benchmarks for the entity store.

use std::path::Path;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use feed_sync::entity::{Cursor, Direction, EntityKind, Post};
use feed_sync::store::snapshot::SnapshotFile;
use feed_sync::store::EntityStore;

fn posts(n: i64) -> Vec<Post> {
    (1..=n)
        .map(|i| {
            let mut post = Post::draft(i % 97, format!("post body {i}"));
            post.id = i;
            post.like_owner_ids = (0..i % 13).collect();
            post
        })
        .collect()
}

fn bench_upsert_page(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = EntityStore::<Post>::in_memory();
    rt.block_on(store.upsert_many(posts(10_000))).unwrap();
    let page = posts(30);

    c.bench_function("upsert_page_30_into_10k", |b| {
        b.iter(|| {
            let merged = rt.block_on(store.upsert_many(black_box(page.clone()))).unwrap();
            black_box(merged);
        })
    });
}

fn bench_scan_window(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = EntityStore::<Post>::in_memory();
    rt.block_on(store.upsert_many(posts(10_000))).unwrap();

    c.bench_function("scan_30_after_cursor_10k", |b| {
        b.iter(|| {
            let rows = rt.block_on(store.scan_ordered(
                black_box(Some(Cursor::new(5_000, 5_000))),
                30,
                Direction::Descending,
            ));
            black_box(rows);
        })
    });
}

fn bench_snapshot_encode(c: &mut Criterion) {
    let rows = posts(5_000);
    let snapshot = SnapshotFile::new(Path::new("/tmp"), EntityKind::Post, true, 3);

    c.bench_function("zstd_snapshot_5k_posts", |b| {
        b.iter(|| {
            let bytes = snapshot.encode(black_box(rows.iter())).unwrap();
            black_box(bytes);
        })
    });
}

criterion_group!(
    benches,
    bench_upsert_page,
    bench_scan_window,
    bench_snapshot_encode,
);
criterion_main!(benches);
