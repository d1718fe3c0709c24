//! Tests for `src/pipeline/photo_cache.rs`: TTL, miss handling, purge.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use courier::pipeline::photo_cache::{PhotoCache, DEFAULT_TTL};

#[tokio::test(start_paused = true)]
async fn hit_within_ttl_skips_fetch() {
    let cache = PhotoCache::default();
    let counter = AtomicUsize::new(0);
    let fetches = &counter;
    let fetch = || async move {
        fetches.fetch_add(1, Ordering::SeqCst);
        Some("data:image/jpeg;base64,AAAA".to_owned())
    };

    let first = cache.get_or_fetch("100", fetch).await;
    tokio::time::advance(Duration::from_secs(3599)).await;
    let second = cache.get_or_fetch("100", fetch).await;

    assert_eq!(first, second);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn expired_entry_is_fetched_again() {
    let cache = PhotoCache::new(DEFAULT_TTL);
    let counter = AtomicUsize::new(0);
    let fetches = &counter;

    let value = cache
        .get_or_fetch("100", || async move {
            fetches.fetch_add(1, Ordering::SeqCst);
            Some("old".to_owned())
        })
        .await;
    assert_eq!(value.as_deref(), Some("old"));

    tokio::time::advance(Duration::from_secs(3601)).await;
    assert!(cache.get("100").is_none(), "expired entry must not be served");

    let value = cache
        .get_or_fetch("100", || async move {
            fetches.fetch_add(1, Ordering::SeqCst);
            Some("new".to_owned())
        })
        .await;
    assert_eq!(value.as_deref(), Some("new"));
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn missing_photo_is_not_cached() {
    let cache = PhotoCache::default();
    let counter = AtomicUsize::new(0);
    let fetches = &counter;
    let fetch = || async move {
        fetches.fetch_add(1, Ordering::SeqCst);
        None
    };

    assert!(cache.get_or_fetch("7", fetch).await.is_none());
    assert!(cache.get_or_fetch("7", fetch).await.is_none());
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn empty_photo_is_not_cached() {
    let cache = PhotoCache::default();
    let counter = AtomicUsize::new(0);
    let fetches = &counter;
    let fetch = || async move {
        fetches.fetch_add(1, Ordering::SeqCst);
        Some(String::new())
    };

    assert!(cache.get_or_fetch("7", fetch).await.is_none());
    assert!(cache.get_or_fetch("7", fetch).await.is_none());
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn purge_removes_only_expired_entries() {
    let cache = PhotoCache::new(Duration::from_secs(60));
    cache.get_or_fetch("a", || async { Some("a".to_owned()) }).await;
    tokio::time::advance(Duration::from_secs(45)).await;
    cache.get_or_fetch("b", || async { Some("b".to_owned()) }).await;
    tokio::time::advance(Duration::from_secs(30)).await;

    assert_eq!(cache.purge_expired(), 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.get("b").as_deref(), Some("b"));
}
