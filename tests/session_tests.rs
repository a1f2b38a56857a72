//! End-to-end session flows against the scripted backend.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};

use flock::artifact::ZipArtifactBuilder;
use flock::blob::memory::InMemoryBlobStore;
use flock::error::{DeployError, FlockError, SlotError};
use flock::invoker::scripted::{ScriptedInvoker, ScriptedReply};
use flock::session::{PrepareOptions, Session};
use flock::FlockConfig;

/// A worker that doubles its input and echoes the globals it was sent.
fn doubler() -> Arc<ScriptedInvoker> {
    Arc::new(ScriptedInvoker::new("FlockLambda", |call| {
        let data: i64 = call.input().unwrap_or_default();
        ScriptedReply::value(data * 2).with_logs([format!("globals={}", call.globals().len())])
    }))
}

fn config(bucket: Option<&str>) -> FlockConfig {
    FlockConfig {
        bucket: bucket.map(str::to_string),
        ..FlockConfig::default()
    }
}

fn session_with(invoker: Arc<ScriptedInvoker>, config: FlockConfig) -> Session {
    Session::new(
        config,
        invoker,
        Arc::new(InMemoryBlobStore::new()),
        Arc::new(ZipArtifactBuilder::new("main.py", b"# entrypoint\n".to_vec())),
    )
    .unwrap()
}

fn session(invoker: Arc<ScriptedInvoker>) -> Session {
    session_with(invoker, config(Some("flock-test")))
}

#[tokio::test]
async fn start_loads_existing_aliases() {
    let invoker = doubler();
    let session = session(invoker.clone());
    let spec = session.config().default_spec();
    invoker.seed_alias(session.cache().resolve(&spec).as_str());

    assert_eq!(session.start().await.unwrap(), 1);

    session
        .prepare(spec, "DATA * 2", &Map::new(), PrepareOptions::default())
        .await
        .unwrap();
    assert_eq!(invoker.probe_count(), 1, "only the function probe from start");
    assert_eq!(invoker.publish_count(), 0);
}

#[tokio::test]
async fn start_fails_without_backend_function() {
    let invoker = Arc::new(
        ScriptedInvoker::new("FlockLambda", |_| ScriptedReply::value(0)).without_function(),
    );
    let err = session(invoker).start().await.unwrap_err();
    assert!(matches!(
        err,
        FlockError::Deploy(DeployError::BackendMissing { function }) if function == "FlockLambda"
    ));
}

#[tokio::test]
async fn syntax_errors_never_reach_the_backend() {
    let invoker = doubler();
    let session = session(invoker.clone());
    let spec = session.config().default_spec();

    let err = session
        .prepare(spec, "print((DATA)", &Map::new(), PrepareOptions::default())
        .await
        .unwrap_err();

    let FlockError::Syntax(syntax) = err else {
        panic!("expected a syntax error");
    };
    assert_eq!(syntax.line, 1);
    assert_eq!(syntax.column, 6);
    assert_eq!(invoker.probe_count(), 0);
    assert_eq!(invoker.publish_count(), 0);
}

#[tokio::test]
async fn prepare_captures_referenced_globals() {
    let session = session(doubler());
    let mut namespace = Map::new();
    namespace.insert("scale".to_string(), json!(10));
    namespace.insert("offset".to_string(), json!(1));
    namespace.insert("unused".to_string(), json!("ignored"));

    let run = session
        .prepare(
            session.config().default_spec(),
            "DATA * scale + offset  # unused",
            &namespace,
            PrepareOptions::default(),
        )
        .await
        .unwrap();

    let mut names: Vec<&String> = run.globals.keys().collect();
    names.sort();
    assert_eq!(names, vec!["offset", "scale"]);

    let result = session.invoke(&run, &4).await;
    assert_eq!(result.value(), Some(&json!(8)));
    assert_eq!(result.logs, vec!["globals=2".to_string()]);
}

#[tokio::test]
async fn stored_configurations_are_reusable() {
    let session = session(doubler());
    let run = session
        .prepare(
            session.config().default_spec(),
            "DATA * 2",
            &Map::new(),
            PrepareOptions::default(),
        )
        .await
        .unwrap();
    session.store("double", run);

    let single = session.invoke_named("double", &21).await.unwrap();
    assert_eq!(single.value_as::<i64>().unwrap(), 42);

    let many = session.map_named("double", &[1, 2, 3]).await.unwrap();
    let values: Vec<i64> = many.iter().map(|r| r.value_as().unwrap()).collect();
    assert_eq!(values, vec![2, 4, 6]);

    let err = session.invoke_named("triple", &1).await.unwrap_err();
    assert!(matches!(err, FlockError::UnknownConfig { name } if name == "triple"));
}

#[tokio::test]
async fn run_n_feeds_the_index_range() {
    let session = session(doubler());
    let run = session
        .prepare(
            session.config().default_spec(),
            "DATA * 2",
            &Map::new(),
            PrepareOptions::default(),
        )
        .await
        .unwrap();

    let values: Vec<i64> = session
        .run_n(&run, 5)
        .await
        .iter()
        .map(|r| r.value_as().unwrap())
        .collect();
    assert_eq!(values, vec![0, 2, 4, 6, 8]);
}

#[tokio::test]
async fn no_install_skips_deployment() {
    let invoker = doubler();
    let session = session(invoker.clone());
    let options = PrepareOptions {
        no_install: true,
        ..PrepareOptions::default()
    };

    let run = session
        .prepare(session.config().default_spec(), "DATA", &Map::new(), options)
        .await
        .unwrap();
    assert_eq!(invoker.publish_count(), 0);

    // Nothing was deployed, so the call fails in its own slot.
    let result = session.invoke(&run, &1).await;
    assert!(matches!(result.error(), Some(SlotError::Invoke(_))));
}

#[tokio::test]
async fn reinstall_republishes() {
    let invoker = doubler();
    let session = session(invoker.clone());
    let spec = session.config().default_spec();

    session
        .prepare(spec.clone(), "DATA", &Map::new(), PrepareOptions::default())
        .await
        .unwrap();
    let options = PrepareOptions {
        reinstall: true,
        ..PrepareOptions::default()
    };
    session.prepare(spec, "DATA", &Map::new(), options).await.unwrap();

    assert_eq!(invoker.publish_count(), 2);
}

#[tokio::test]
async fn save_and_load_use_the_session_bucket() {
    let session = session(doubler());
    session.save("models/weights.bin", vec![1, 2, 3]).await.unwrap();
    assert_eq!(session.load("models/weights.bin").await.unwrap(), vec![1, 2, 3]);

    let err = session.load("models/missing.bin").await.unwrap_err();
    assert!(matches!(err, FlockError::Blob(_)));
}

#[tokio::test]
async fn save_without_bucket_is_rejected() {
    let session = session_with(doubler(), config(None));
    let err = session.save("k", Vec::new()).await.unwrap_err();
    assert!(matches!(err, FlockError::NoBucket));
}

#[tokio::test]
async fn clean_removes_everything() {
    let invoker = doubler();
    let session = session(invoker.clone());
    let spec = session.config().default_spec();
    session
        .prepare(spec.clone(), "DATA", &Map::new(), PrepareOptions::default())
        .await
        .unwrap();

    let report = session.clean().await.unwrap();
    assert_eq!(report.aliases_removed, 1);
    assert_eq!(report.versions_removed, 1);
    assert!(session.cache().registry().is_empty());

    assert!(!session.remove(&spec).await.unwrap());
}

#[tokio::test]
async fn new_entrypoint_gets_fresh_aliases() {
    let invoker = doubler();
    let spec = FlockConfig::default().default_spec();
    let first = session(invoker.clone());
    let old = first
        .prepare(spec.clone(), "DATA", &Map::new(), PrepareOptions::default())
        .await
        .unwrap();

    let second = Session::new(
        config(Some("flock-test")),
        invoker.clone(),
        Arc::new(InMemoryBlobStore::new()),
        Arc::new(ZipArtifactBuilder::new("main.py", b"# entrypoint v2\n".to_vec())),
    )
    .unwrap();
    let new = second
        .prepare(spec, "DATA", &Map::new(), PrepareOptions::default())
        .await
        .unwrap();

    assert_ne!(old.alias, new.alias);
    assert_eq!(invoker.publish_count(), 2);
}

#[test]
fn invalid_config_is_rejected() {
    let config = FlockConfig {
        memory_mb: 64,
        ..FlockConfig::default()
    };
    let err = Session::new(
        config,
        doubler(),
        Arc::new(InMemoryBlobStore::new()),
        Arc::new(ZipArtifactBuilder::new("main.py", Vec::new())),
    )
    .unwrap_err();
    assert!(matches!(err, FlockError::Config(_)));
}

#[tokio::test]
async fn results_serialize_for_reporting() {
    let session = session(doubler());
    let run = session
        .prepare(
            session.config().default_spec(),
            "DATA",
            &Map::new(),
            PrepareOptions::default(),
        )
        .await
        .unwrap();

    let encoded = serde_json::to_value(&run).unwrap();
    assert_eq!(encoded["alias"], Value::String(run.alias.to_string()));
    assert_eq!(encoded["code"], json!("DATA"));
}
