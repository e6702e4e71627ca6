use std::sync::Arc;

use proptest::prelude::*;
use proptest::test_runner::Config;
use quote_shared::{
    default_seed, Filter, MemoryKvStore, Persistence, Quote, QuoteStore, StoreConfig,
};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn fresh_store(seed: u64) -> QuoteStore {
    let persistence = Arc::new(Persistence::new(
        Arc::new(MemoryKvStore::new()),
        Arc::new(MemoryKvStore::new()),
    ));
    QuoteStore::new(StoreConfig::default(), persistence).with_rng_seed(seed)
}

fn quote_strategy() -> impl Strategy<Value = (String, String)> {
    (
        "[A-Za-z][A-Za-z ,.!']{0,40}",
        prop_oneof![
            Just("life".to_string()),
            Just("Life".to_string()),
            Just("design".to_string()),
            "[a-z]{1,10}",
        ],
    )
}

proptest! {
    #![proptest_config(Config::with_cases(64))]

    #[test]
    fn select_all_returns_a_member(
        entries in prop::collection::vec(quote_strategy(), 1..20),
        rng_seed in any::<u64>(),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let seed: Vec<Quote> = entries
                .iter()
                .map(|(t, c)| Quote::new(t, c).unwrap())
                .collect();
            let store = fresh_store(rng_seed);
            store.initialize(seed).await;

            let quotes = store.quotes().await;
            for _ in 0..5 {
                let chosen = store.select(&Filter::All).await.unwrap();
                prop_assert!(quotes.contains(&chosen));
            }
            Ok(())
        })?;
    }

    #[test]
    fn absent_category_is_empty_result(
        entries in prop::collection::vec(quote_strategy(), 0..10),
        missing in "[0-9]{3,8}",
    ) {
        let rt = runtime();
        rt.block_on(async {
            let seed: Vec<Quote> = entries
                .iter()
                .map(|(t, c)| Quote::new(t, c).unwrap())
                .collect();
            let store = fresh_store(1);
            store.initialize(seed).await;

            let result = store.select(&Filter::parse(&missing)).await;
            prop_assert!(result.is_err());
            prop_assert_eq!(result.unwrap_err().kind(), quote_shared::ErrorKind::EmptyResult);
            Ok(())
        })?;
    }

    #[test]
    fn blank_fields_never_mutate(
        text in "[ \t\n]{0,5}",
        category in "[a-z]{1,8}",
    ) {
        let rt = runtime();
        rt.block_on(async {
            let store = fresh_store(2);
            store.initialize(default_seed()).await;
            let before = store.len().await;

            prop_assert!(store.add(&text, &category).await.is_err());
            prop_assert!(store.add(&category, &text).await.is_err());
            prop_assert_eq!(store.len().await, before);
            Ok(())
        })?;
    }

    #[test]
    fn category_indexed_once_across_casing(
        category in "[a-z]{1,12}",
        upper_mask in prop::collection::vec(any::<bool>(), 12),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let store = fresh_store(3);
            store.initialize(default_seed()).await;

            let shouted: String = category
                .chars()
                .zip(upper_mask.iter().chain(std::iter::repeat(&false)))
                .map(|(c, up)| if *up { c.to_ascii_uppercase() } else { c })
                .collect();
            store.add("first", &category).await.unwrap();
            store.add("second", &shouted).await.unwrap();

            let categories = store.categories().await;
            prop_assert_eq!(categories.iter().filter(|c| **c == category).count(), 1);
            Ok(())
        })?;
    }

    #[test]
    fn export_import_roundtrip(
        entries in prop::collection::vec(quote_strategy(), 0..15),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let source = fresh_store(4);
            source.initialize(Vec::new()).await;
            for (text, category) in &entries {
                source.add(text, category).await.unwrap();
            }
            let exported = source.serialize_all().await.unwrap();

            let target = fresh_store(5);
            target.initialize(Vec::new()).await;
            let items: Vec<serde_json::Value> = serde_json::from_str(&exported).unwrap();
            let outcome = target.merge_imported(items).await;

            prop_assert_eq!(outcome.added, entries.len());
            prop_assert_eq!(outcome.updated, 0);
            prop_assert_eq!(outcome.rejected, 0);

            let pairs = |quotes: Vec<Quote>| -> Vec<(String, String)> {
                quotes
                    .into_iter()
                    .map(|q| (q.text().to_string(), q.category().to_string()))
                    .collect()
            };
            prop_assert_eq!(pairs(target.quotes().await), pairs(source.quotes().await));
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn selection_is_roughly_uniform() {
    let store = fresh_store(42);
    store.initialize(default_seed()).await;

    let mut counts = std::collections::HashMap::new();
    for _ in 0..6000 {
        let quote = store.select(&Filter::All).await.unwrap();
        *counts.entry(quote.text().to_string()).or_insert(0u32) += 1;
    }

    assert_eq!(counts.len(), 6);
    for count in counts.values() {
        assert!((700..1300).contains(count), "skewed count {count}");
    }
}
