//! Criterion benchmarks for the Kontos write path.
//!
//! Covers the hot paths of the writer:
//! - Plain document buffering
//! - Update-by-term (delete then add)
//! - Full flush and commit

use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use kontos::document::{Document, Term};
use kontos::storage::{MemoryStorage, Storage, StorageConfig};
use kontos::writer::{IndexWriter, WriterConfig};

/// Generate test documents for benchmarking.
fn generate_test_documents(count: usize) -> Vec<Document> {
    let words = [
        "search", "engine", "full", "text", "index", "query", "document", "field", "term",
        "segment", "flush", "commit", "delete", "update", "buffer", "ticket",
    ];

    (0..count)
        .map(|i| {
            let body: Vec<&str> = (0..12).map(|j| words[(i + j) % words.len()]).collect();
            Document::builder()
                .add_text("id", i.to_string())
                .add_text("body", body.join(" "))
                .build()
        })
        .collect()
}

fn memory_writer() -> IndexWriter {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new(StorageConfig::default()));
    let config = WriterConfig {
        commit_on_close: false,
        ..Default::default()
    };
    IndexWriter::new(storage, config).unwrap()
}

fn bench_add_documents(c: &mut Criterion) {
    let docs = generate_test_documents(1000);

    let mut group = c.benchmark_group("add_documents");
    group.throughput(Throughput::Elements(docs.len() as u64));
    group.bench_function("add_1000", |b| {
        b.iter(|| {
            let writer = memory_writer();
            for doc in &docs {
                black_box(writer.add_document(doc.clone()).unwrap());
            }
            writer.rollback().unwrap();
        })
    });
    group.finish();
}

fn bench_update_documents(c: &mut Criterion) {
    let docs = generate_test_documents(500);

    let mut group = c.benchmark_group("update_documents");
    group.throughput(Throughput::Elements(docs.len() as u64));
    group.bench_function("update_500", |b| {
        b.iter(|| {
            let writer = memory_writer();
            for (i, doc) in docs.iter().enumerate() {
                let term = Term::new("id", (i % 50).to_string());
                black_box(writer.update_document(term, doc.clone()).unwrap());
            }
            writer.rollback().unwrap();
        })
    });
    group.finish();
}

fn bench_flush_and_commit(c: &mut Criterion) {
    let docs = generate_test_documents(1000);

    let mut group = c.benchmark_group("commit");
    group.throughput(Throughput::Elements(docs.len() as u64));
    group.bench_function("commit_1000", |b| {
        b.iter(|| {
            let writer = memory_writer();
            for doc in &docs {
                writer.add_document(doc.clone()).unwrap();
            }
            black_box(writer.commit().unwrap());
            writer.rollback().unwrap();
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_add_documents,
    bench_update_documents,
    bench_flush_and_commit
);
criterion_main!(benches);
