//! Block cache: coalesced fetches, eviction, tidying, shutdown.

#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{dir, file, ImageBuilder};
use dwarfs::cache::{BlockCache, CacheOptions, Codec, TidyConfig, TidyStrategy};
use dwarfs::image::{section::ImageOffset, ImageReader, MlockMode, SectionIndex};
use dwarfs::Error;
use tempfile::tempdir;

const BLOCK: usize = 1024;

/// Image with `n` full blocks of a deterministic pattern.
fn pattern(n: usize) -> Vec<u8> {
    (0..n * BLOCK).map(|i| (i % 251) as u8).collect()
}

fn build_cache(blocks: usize, max_bytes: usize) -> (tempfile::TempDir, BlockCache) {
    let image = ImageBuilder::new()
        .block_size(BLOCK as u32)
        .codec(Codec::Zlib)
        .build(&dir(vec![("data", file(pattern(blocks)))]));

    let tmp = tempdir().unwrap();
    let path = tmp.path().join("img");
    std::fs::write(&path, &image).unwrap();

    let map = Arc::new(ImageReader::open(&path, MlockMode::None).unwrap());
    let sections = Arc::new(SectionIndex::scan(&map, ImageOffset::Explicit0).unwrap());
    let cache = BlockCache::new(
        map,
        sections,
        &CacheOptions {
            max_bytes,
            num_workers: 2,
            decompress_ratio: 0.8,
            init_workers: true,
        },
    );
    (tmp, cache)
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn get_returns_decompressed_block_bytes() {
    let (_tmp, cache) = build_cache(3, 64 << 20);
    let expected = pattern(3);

    for id in 0..3u32 {
        let block = cache.get(id).unwrap();
        assert_eq!(&block[..], &expected[id as usize * BLOCK..(id as usize + 1) * BLOCK]);
    }

    let stats = cache.stats();
    assert_eq!(stats.misses, 3);
    assert_eq!(stats.decompressions, 3);
    assert_eq!(stats.blocks_cached, 3);
    assert_eq!(stats.bytes_cached, 3 * BLOCK as u64);

    // Second round is all hits.
    for id in 0..3u32 {
        cache.get(id).unwrap();
    }
    assert_eq!(cache.stats().hits, 3);
    assert_eq!(cache.stats().decompressions, 3);
}

#[test]
fn concurrent_cold_reads_run_one_decompression() {
    // At most one build per block id, cluster-wide.
    let (_tmp, cache) = build_cache(1, 64 << 20);
    let cache = Arc::new(cache);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        handles.push(std::thread::spawn(move || cache.get(0).unwrap().to_vec()));
    }
    let results: Vec<Vec<u8>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let expected = pattern(1);
    for r in &results {
        assert_eq!(r, &expected);
    }
    assert_eq!(cache.stats().decompressions, 1);
}

#[test]
fn lru_eviction_keeps_bytes_under_budget() {
    // Budget fits two blocks; reading three forces one eviction.
    let (_tmp, cache) = build_cache(3, 2 * BLOCK);

    for id in 0..3u32 {
        drop(cache.get(id).unwrap());
    }

    let stats = cache.stats();
    assert!(stats.evictions >= 1, "expected evictions, got {stats:?}");
    assert!(stats.bytes_cached <= 2 * BLOCK as u64);
    // Block 0 was least recently used when block 2 arrived.
    assert!(!cache.is_resident(0));
    assert!(cache.is_resident(2));

    // Evicted blocks come back correct on re-read.
    let expected = pattern(3);
    assert_eq!(&cache.get(0).unwrap()[..], &expected[..BLOCK]);
}

#[test]
fn pinned_entries_are_skipped_and_budget_is_soft() {
    let (_tmp, cache) = build_cache(2, BLOCK);

    // Hold both blocks; neither is evictable, so the cache admits the
    // second block over budget and bumps the warning counter.
    let a = cache.get(0).unwrap();
    let b = cache.get(1).unwrap();

    let stats = cache.stats();
    assert!(stats.budget_overruns >= 1);
    assert_eq!(stats.bytes_cached, 2 * BLOCK as u64);

    // Pinned bytes stay valid regardless of cache pressure.
    let expected = pattern(2);
    assert_eq!(&a[..], &expected[..BLOCK]);
    assert_eq!(&b[..], &expected[BLOCK..]);

    // Once the pins drop, pressure from a re-read can evict.
    drop(a);
    drop(b);
    drop(cache.get(0).unwrap());
    assert!(cache.stats().bytes_cached <= 2 * BLOCK as u64);
}

#[test]
fn prefetch_installs_without_waiter() {
    let (_tmp, cache) = build_cache(2, 64 << 20);

    cache.prefetch(1);
    wait_until("prefetch completion", || cache.is_resident(1));

    // The later get is a hit; only the prefetch decompressed.
    let block = cache.get(1).unwrap();
    assert_eq!(&block[..], &pattern(2)[BLOCK..]);
    let stats = cache.stats();
    assert_eq!(stats.decompressions, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 0);
}

#[test]
fn decompression_failure_propagates_and_clears_the_entry() {
    // Valid checksum over garbage: the section scan passes, the codec
    // fails at fetch time.
    let garbage = b"not a zstd frame at all";
    let mut image = Vec::new();
    common::write_raw_section(
        &mut image,
        common::KIND_BLOCK,
        Codec::Zstd.as_raw(),
        garbage,
        xxhash_rust::xxh3::xxh3_64(garbage),
    );
    common::write_section(&mut image, common::KIND_METADATA, Codec::Null, b"{}");

    let tmp = tempdir().unwrap();
    let path = tmp.path().join("img");
    std::fs::write(&path, &image).unwrap();
    let map = Arc::new(ImageReader::open(&path, MlockMode::None).unwrap());
    let sections = Arc::new(SectionIndex::scan(&map, ImageOffset::Explicit0).unwrap());
    let cache = BlockCache::new(map, sections, &CacheOptions::default());

    let err = cache.get(0).unwrap_err();
    let domain = err.downcast_ref::<Error>().expect("domain error");
    assert!(matches!(domain, Error::Decompress(_)));
    assert!(!cache.is_resident(0));

    // The failed entry is gone; a retry starts a fresh build.
    let _ = cache.get(0).unwrap_err();
    assert_eq!(cache.stats().decompressions, 2);
}

#[test]
fn tidy_time_strategy_evicts_idle_blocks() {
    let (_tmp, cache) = build_cache(1, 64 << 20);
    cache.set_tidy_config(TidyConfig {
        strategy: TidyStrategy::Time,
        interval: Duration::from_millis(50),
        max_age: Duration::from_millis(100),
    });

    drop(cache.get(0).unwrap());
    assert!(cache.is_resident(0));

    wait_until("tidy eviction", || !cache.is_resident(0));
    assert!(cache.stats().tidy_evictions >= 1);
}

#[test]
fn shutdown_cancels_and_frees_everything() {
    let (_tmp, cache) = build_cache(2, 64 << 20);
    drop(cache.get(0).unwrap());

    cache.shutdown();

    let err = cache.get(1).unwrap_err();
    let domain = err.downcast_ref::<Error>().expect("domain error");
    assert!(matches!(domain, Error::ShuttingDown));

    let stats = cache.stats();
    assert_eq!(stats.bytes_cached, 0);
    assert_eq!(stats.blocks_cached, 0);

    // Idempotent.
    cache.shutdown();
}
