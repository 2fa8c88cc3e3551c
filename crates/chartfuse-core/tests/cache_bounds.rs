//! Bounds of the value cache under sustained insertion.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chartfuse_core::{NodeValue, ValueCache};
use chartfuse_data::Table;
use serde_json::{json, Value};

fn value_of_rows(n: usize) -> NodeValue {
    let rows: Vec<Value> = (0..n).map(|i| json!({"i": i, "label": format!("row {i}")})).collect();
    NodeValue::table(Table::from_json(&Value::Array(rows)).unwrap())
}

#[tokio::test]
async fn memory_stays_within_the_limit() {
    let limit = value_of_rows(40).size_of() * 3;
    let cache = ValueCache::new(None, Some(limit));

    for step in 0..200usize {
        let rows = (step * 7) % 50 + 1;
        let fingerprint = format!("fp-{}", step % 60);
        let value = value_of_rows(rows);
        cache
            .insert_or_join(&fingerprint, async move { Ok(value) })
            .await
            .unwrap();
        assert!(
            cache.total_memory() <= limit,
            "step {step}: {} > {limit}",
            cache.total_memory()
        );
        assert_eq!(
            cache.total_memory(),
            cache.protected_memory() + cache.probationary_memory()
        );
    }
    assert!(cache.size() > 0);
}

#[tokio::test]
async fn entry_count_stays_within_capacity() {
    let cache = ValueCache::new(Some(5), None);
    for i in 0..50 {
        let value = value_of_rows(1);
        cache
            .insert_or_join(&format!("fp-{i}"), async move { Ok(value) })
            .await
            .unwrap();
        // re-reading some entries moves them to the protected segment
        if i % 3 == 0 {
            cache.get(&format!("fp-{i}"));
        }
        assert!(cache.size() <= 5);
    }
}

#[tokio::test]
async fn oversized_values_are_returned_but_not_stored() {
    let small = value_of_rows(2);
    let cache = ValueCache::new(None, Some(small.size_of() * 2));
    let big = value_of_rows(100);
    let expected = big.clone();
    let out = cache
        .insert_or_join("big", async move { Ok(big) })
        .await
        .unwrap();
    assert_eq!(out, expected);
    assert_eq!(cache.size(), 0);
    assert_eq!(cache.total_memory(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_waiters_see_one_computation() {
    let cache = ValueCache::new(Some(16), None);
    let runs = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..32 {
        let cache = cache.clone();
        let runs = Arc::clone(&runs);
        handles.push(tokio::spawn(async move {
            cache
                .insert_or_join("shared", async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok(value_of_rows(3))
                })
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), value_of_rows(3));
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}
