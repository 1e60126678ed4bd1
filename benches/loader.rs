use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use coalesce_loader::sources::kv::{FetchOutcome, KvSource};
use coalesce_loader::{DynKey, DynValue, Loader, LoaderOptions};

fn ident_source() -> KvSource<&'static str, u64, u64> {
    KvSource::new(Arc::new(|_batch: &'static str, items: HashSet<u64>| {
        Box::pin(async move {
            let mut out = HashMap::with_capacity(items.len());
            for item in items {
                out.insert(item, Ok(item));
            }
            FetchOutcome::Items(out)
        })
    }))
    .build()
}

fn keys(size: u64) -> Vec<DynKey> {
    (0..size).map(DynKey::new).collect()
}

fn main() {
    divan::main();
}

#[divan::bench(args = [250, 1000])]
fn load_misses(bencher: divan::Bencher, size: u64) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    bencher.counter(size).bench(|| {
        runtime.block_on(async {
            let mut loader = Loader::new(LoaderOptions::default());
            loader.add_source("ident", ident_source());
            loader.load_many("ident", DynKey::new("batch"), keys(size)).unwrap();
            loader.run().await;
            let results = loader.get_many("ident", &DynKey::new("batch"), keys(size)).unwrap();
            for (n, outcome) in results.into_iter().enumerate() {
                assert_eq!(outcome.into_raised().unwrap().downcast::<u64>().unwrap(), n as u64);
            }
        });
    });
}

#[divan::bench(args = [250, 1000])]
fn load_hits(bencher: divan::Bencher, size: u64) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut loader = Loader::new(LoaderOptions::default());
    loader.add_source("ident", ident_source());
    for n in 0..size {
        loader
            .put("ident", DynKey::new("batch"), DynKey::new(n), DynValue::new(n))
            .unwrap();
    }

    bencher.counter(size).bench(|| {
        runtime.block_on(async {
            let results = loader.get_many("ident", &DynKey::new("batch"), keys(size)).unwrap();
            for (n, outcome) in results.into_iter().enumerate() {
                assert_eq!(outcome.into_raised().unwrap().downcast::<u64>().unwrap(), n as u64);
            }
        });
    });
}

#[divan::bench(args = [250, 1000])]
fn load_hits_and_misses(bencher: divan::Bencher, size: u64) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    bencher.counter(size).bench(|| {
        runtime.block_on(async {
            let mut loader = Loader::new(LoaderOptions::default());
            loader.add_source("ident", ident_source());
            for n in (0..size).filter(|n| n % 2 == 0) {
                loader
                    .put("ident", DynKey::new("batch"), DynKey::new(n), DynValue::new(n))
                    .unwrap();
            }
            loader.load_many("ident", DynKey::new("batch"), keys(size)).unwrap();
            loader.run().await;
            let results = loader.get_many("ident", &DynKey::new("batch"), keys(size)).unwrap();
            for (n, outcome) in results.into_iter().enumerate() {
                assert_eq!(outcome.into_raised().unwrap().downcast::<u64>().unwrap(), n as u64);
            }
        });
    });
}

#[divan::bench(args = [25, 100])]
fn many_independent_sources(bencher: divan::Bencher, source_count: u64) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    bencher.counter(source_count).bench(|| {
        runtime.block_on(async {
            let mut loader = Loader::new(LoaderOptions::default());
            for n in 0..source_count {
                loader.add_source(format!("source-{n}"), ident_source());
            }
            for n in 0..source_count {
                loader
                    .load_many(&format!("source-{n}"), DynKey::new("batch"), keys(50))
                    .unwrap();
            }
            loader.run().await;
            for n in 0..source_count {
                let results = loader
                    .get_many(&format!("source-{n}"), &DynKey::new("batch"), keys(50))
                    .unwrap();
                assert_eq!(results.len(), 50);
            }
        });
    });
}
