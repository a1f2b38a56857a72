//! Transport codec behaviour around the inline limit and blob spill.

use std::collections::BTreeMap;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use flock::blob::memory::InMemoryBlobStore;
use flock::blob::BlobStore;
use flock::codec::{BlobContext, Codec, EncodedValue, CHUNK_PREFIX, MAX_BLOB_DEPTH};
use flock::error::CodecError;

fn spilling(limit: usize) -> (Codec, Arc<InMemoryBlobStore>) {
    let store = Arc::new(InMemoryBlobStore::new());
    let codec = Codec::new()
        .with_inline_limit(limit)
        .with_blob_store(BlobContext::new(store.clone(), "flock-test"));
    (codec, store)
}

fn inline_len(value: &impl Serialize) -> usize {
    match Codec::encode_inline(value).unwrap() {
        EncodedValue::Inline { data } => data.len(),
        EncodedValue::Blob { .. } => unreachable!("encode_inline never spills"),
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Sample {
    name: String,
    weights: Vec<f64>,
    tags: BTreeMap<String, i32>,
}

#[tokio::test]
async fn round_trips_common_values() {
    let codec = Codec::new();

    let n: i64 = codec.decode(&codec.encode(&42i64).await.unwrap()).await.unwrap();
    assert_eq!(n, 42);

    let s: String = codec.decode(&codec.encode("hello").await.unwrap()).await.unwrap();
    assert_eq!(s, "hello");

    let nested = json!({"a": [1, 2, {"b": null}], "c": {"d": true}});
    let back: Value = codec.decode(&codec.encode(&nested).await.unwrap()).await.unwrap();
    assert_eq!(back, nested);

    let sample = Sample {
        name: "run".to_string(),
        weights: vec![0.5, 1.25, -3.0],
        tags: BTreeMap::from([("x".to_string(), 1), ("y".to_string(), -2)]),
    };
    let back: Sample = codec.decode(&codec.encode(&sample).await.unwrap()).await.unwrap();
    assert_eq!(back, sample);
}

#[tokio::test]
async fn large_arrays_spill_and_come_back() {
    let (codec, store) = spilling(1024);
    let floats: Vec<f64> = (0..10_000).map(|i| f64::from(i) * 0.37).collect();

    let encoded = codec.encode(&floats).await.unwrap();
    let EncodedValue::Blob { bucket, key } = &encoded else {
        panic!("expected a blob pointer, got {encoded:?}");
    };
    assert_eq!(bucket, "flock-test");
    assert!(key.starts_with(CHUNK_PREFIX));
    assert!(store.contains(bucket, key));

    let back: Vec<f64> = codec.decode(&encoded).await.unwrap();
    assert_eq!(back, floats);
}

#[tokio::test]
async fn limit_equal_to_length_stays_inline() {
    let value = json!({"payload": "x".repeat(300)});
    let len = inline_len(&value);

    let (at_limit, store) = spilling(len);
    assert!(at_limit.encode(&value).await.unwrap().is_inline());
    assert!(store.is_empty());

    let (below_limit, store) = spilling(len - 1);
    let encoded = below_limit.encode(&value).await.unwrap();
    assert!(!encoded.is_inline());
    assert_eq!(store.len(), 1);
    let back: Value = below_limit.decode(&encoded).await.unwrap();
    assert_eq!(back, value);
}

#[tokio::test]
async fn identical_values_share_a_chunk() {
    let (codec, store) = spilling(16);
    let value = vec!["same"; 64];
    let first = codec.encode(&value).await.unwrap();
    let second = codec.encode(&value).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn overflow_without_store_is_an_error() {
    let codec = Codec::new().with_inline_limit(4);
    let err = codec.encode(&"too long for four bytes").await.unwrap_err();
    assert!(matches!(err, CodecError::Overflow { limit: 4, .. }));
}

#[tokio::test]
async fn pointer_chains_are_bounded() {
    let (codec, store) = spilling(1024);
    let bucket = "flock-test";

    // Each object holds a pointer to the next; the last one holds a value.
    let last = Codec::encode_inline(&"bottom").unwrap();
    store
        .put(bucket, "chain/0", serde_json::to_vec(&last).unwrap())
        .await
        .unwrap();
    for depth in 1..=MAX_BLOB_DEPTH {
        let pointer = EncodedValue::Blob {
            bucket: bucket.to_string(),
            key: format!("chain/{}", depth - 1),
        };
        store
            .put(bucket, &format!("chain/{depth}"), serde_json::to_vec(&pointer).unwrap())
            .await
            .unwrap();
    }

    let within = EncodedValue::Blob {
        bucket: bucket.to_string(),
        key: format!("chain/{}", MAX_BLOB_DEPTH - 1),
    };
    let value: String = codec.decode(&within).await.unwrap();
    assert_eq!(value, "bottom");

    let beyond = EncodedValue::Blob {
        bucket: bucket.to_string(),
        key: format!("chain/{MAX_BLOB_DEPTH}"),
    };
    let err = codec.decode::<String>(&beyond).await.unwrap_err();
    assert!(matches!(err, CodecError::TooDeep { max } if max == MAX_BLOB_DEPTH));
}

#[tokio::test]
async fn missing_chunk_is_reported() {
    let (codec, _store) = spilling(16);
    let pointer = EncodedValue::Blob {
        bucket: "flock-test".to_string(),
        key: "chunks/does-not-exist".to_string(),
    };
    let err = codec.decode::<Value>(&pointer).await.unwrap_err();
    assert!(matches!(err, CodecError::Blob(_)));
}

mod properties {
    use proptest::prelude::*;
    use serde_json::Value;

    use flock::codec::Codec;

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "\\PC{0,24}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map("[a-z_]{1,8}", inner, 0..6)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        /// Inline encoding loses nothing for any JSON value.
        #[test]
        fn inline_round_trip(value in arb_json()) {
            let encoded = Codec::encode_inline(&value).unwrap();
            prop_assert!(encoded.is_inline());
            let back: Value = Codec::decode_inline(&encoded).unwrap();
            prop_assert_eq!(back, value);
        }
    }
}
