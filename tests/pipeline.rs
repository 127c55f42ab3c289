//! End-to-end pipeline tests against the stubbed provider.
//!
//! These drive [`Engine::process`] with real files on disk and assert on the
//! serialized event stream, the same view an SSE client gets.

use std::io::Write as _;
use std::sync::Arc;

use futures::StreamExt as _;
use serde_json::{Value, json};
use zip::write::SimpleFileOptions;

use docstream::{
    config::Config,
    convert::FileEntry,
    engine::Engine,
    events::Event,
    pipeline::ProcessRequest,
    provider::{
        Providers,
        stub::{StubProvider, StubReply},
    },
};

struct TestHarness {
    engine: Arc<Engine>,
    stub: Arc<StubProvider>,
    _dir: tempfile::TempDir,
    dir_path: std::path::PathBuf,
}

async fn harness_with(stub: StubProvider, enable_partial: bool) -> TestHarness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.database.processing_logs.path = dir.path().join("logs.db");
    config.paths.temp_extract_dir = dir.path().join("extract");
    config.paths.uploads_dir = dir.path().join("uploads");
    config.paths.schemas_dir = dir.path().join("schemas");
    config.structured_analysis.streaming.enable_partial = enable_partial;
    config.structured_analysis.default_model = "stub-model".to_string();
    config.ai_processing.retry_attempts = 0;
    config.markdown_conversion.max_workers = 2;

    let stub = Arc::new(stub);
    let engine = Engine::new(config, Providers::stubbed(stub.clone())).unwrap();
    engine.start().await.unwrap();
    let dir_path = dir.path().to_path_buf();
    TestHarness {
        engine,
        stub,
        _dir: dir,
        dir_path,
    }
}

impl TestHarness {
    fn write_file(&self, name: &str, contents: &str) -> std::path::PathBuf {
        let path = self.dir_path.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    async fn run(&self, files: Vec<FileEntry>, schema_key: &str) -> Vec<Value> {
        let stream = self
            .engine
            .process(ProcessRequest {
                files,
                schema_key: schema_key.to_string(),
                instructions: String::new(),
                model_id: None,
                run_id: None,
            })
            .unwrap();
        let events: Vec<Event> = stream.collect().await;
        events
            .iter()
            .map(|event| serde_json::to_value(event).unwrap())
            .collect()
    }
}

fn events_of_type<'a>(events: &'a [Value], kind: &str) -> Vec<&'a Value> {
    events.iter().filter(|e| e["type"] == kind).collect()
}

fn valid_invoice() -> Value {
    json!({"vendor": "Acme", "number": "42", "amount": 100.0})
}

#[tokio::test]
async fn flat_schema_cache_miss_then_hit() {
    let harness = harness_with(StubProvider::always(valid_invoice()), false).await;
    let path = harness.write_file("invoice.txt", "Hello Acme, invoice #42 for $100.");

    // First run: a cache miss that calls the provider.
    let first = harness.run(vec![FileEntry::direct(&path)], "invoice").await;
    let results = events_of_type(&first, "result");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["status"], "success");
    assert!(results[0].get("cached").is_none());
    assert_eq!(results[0]["structured_data"]["vendor"], "Acme");
    assert_eq!(results[0]["structured_data"]["amount"], 100.0);
    assert_eq!(harness.stub.chat_call_count(), 1);

    // Second run with identical inputs: served from cache, no tokens.
    let second = harness.run(vec![FileEntry::direct(&path)], "invoice").await;
    let results = events_of_type(&second, "result");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["cached"], true);
    assert_eq!(
        results[0]["structured_data"],
        first_result_structured(&first)
    );
    assert_eq!(harness.stub.chat_call_count(), 1);
    let complete = &events_of_type(&second, "complete")[0];
    assert_eq!(complete["token_usage"]["total_tokens"], 0);
    assert_eq!(complete["token_usage"]["cached"], 1);

    // Both runs reached the ledger.
    let runs = harness.engine.ledger.recent_runs(10, None).await;
    assert_eq!(runs.len(), 2);
    for run in &runs {
        assert_eq!(run["status"], "completed");
        assert_eq!(run["successful_files"], 1);
    }
}

fn first_result_structured(events: &[Value]) -> Value {
    events_of_type(events, "result")[0]["structured_data"].clone()
}

#[tokio::test]
async fn nested_schema_expands_to_one_event_per_item() {
    let harness = harness_with(
        StubProvider::always(json!({
            "item": [
                {"vendor": "A", "number": "1", "amount": 10.0},
                {"vendor": "B", "number": "2", "amount": 20.0},
            ]
        })),
        false,
    )
    .await;
    let path = harness.write_file("invoices.md", "# Two invoices\n\nA and B.");

    let events = harness.run(vec![FileEntry::direct(&path)], "invoices").await;
    let results = events_of_type(&events, "result");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["source_file"], results[1]["source_file"]);
    assert_eq!(results[0]["is_primary_result"], true);
    assert_eq!(results[1]["is_primary_result"], false);
    assert_eq!(results[0]["structured_data"]["vendor"], "A");
    assert_eq!(results[1]["structured_data"]["vendor"], "B");

    // The file counts once, not per expanded row.
    let complete = &events_of_type(&events, "complete")[0];
    assert_eq!(complete["successful"], 1);
    assert_eq!(complete["failed"], 0);
}

#[tokio::test]
async fn unsupported_files_fail_without_ai_work() {
    let harness = harness_with(StubProvider::always(valid_invoice()), false).await;
    let path = harness.write_file("data.xyz", "whatever");

    let events = harness.run(vec![FileEntry::direct(&path)], "invoice").await;

    let summary = &events_of_type(&events, "conversion_summary")[0];
    assert_eq!(summary["failed"], 1);
    assert_eq!(summary["successful"], 0);

    let results = events_of_type(&events, "result");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["status"], "error");
    assert_eq!(results[0]["error_kind"], "unsupported");
    assert_eq!(results[0]["is_primary_result"], true);

    let complete = &events_of_type(&events, "complete")[0];
    assert_eq!(complete["failed"], 1);
    assert_eq!(complete["successful"], 0);

    // No provider calls happened.
    assert_eq!(harness.stub.chat_call_count(), 0);
}

#[tokio::test]
async fn partial_streaming_yields_partials_then_one_result() {
    let stub = StubProvider::scripted(
        vec![StubReply::Chunks(vec![
            r#"{"vendor": "Acme""#.to_string(),
            r#", "number": "42""#.to_string(),
            r#", "amount": 100.0}"#.to_string(),
        ])],
        StubReply::Value(valid_invoice()),
    );
    let harness = harness_with(stub, true).await;
    let path = harness.write_file("doc.txt", "invoice text");

    let events = harness.run(vec![FileEntry::direct(&path)], "invoice").await;

    let partials = events_of_type(&events, "partial");
    assert!(partials.len() >= 2, "expected progressive partials");
    let results = events_of_type(&events, "result");
    assert_eq!(results.len(), 1);

    // Partials precede the terminal result and carry no counters.
    let first_partial_pos = events.iter().position(|e| e["type"] == "partial").unwrap();
    let result_pos = events.iter().position(|e| e["type"] == "result").unwrap();
    assert!(first_partial_pos < result_pos);
    for partial in &partials {
        assert!(partial.get("progress").is_none());
    }
}

#[tokio::test]
async fn zip_archives_expand_and_hidden_entries_are_skipped() {
    let harness = harness_with(StubProvider::always(valid_invoice()), false).await;

    let zip_path = harness.dir_path.join("batch.zip");
    let file = std::fs::File::create(&zip_path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    for (name, contents) in [
        ("a.txt", "alpha"),
        ("sub/b.txt", "beta"),
        (".hidden", "no"),
        ("__meta", "no"),
    ] {
        writer.start_file(name, SimpleFileOptions::default()).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap();

    let events = harness
        .run(vec![FileEntry::direct(&zip_path)], "invoice")
        .await;

    let init = &events_of_type(&events, "init")[0];
    assert_eq!(init["total_files"], 2);

    let results = events_of_type(&events, "result");
    let mut names: Vec<String> = results
        .iter()
        .map(|r| r["filename"].as_str().unwrap().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["batch.zip → a.txt", "batch.zip → sub/b.txt"]);

    let complete = &events_of_type(&events, "complete")[0];
    assert_eq!(complete["successful"], 2);
}

#[tokio::test]
async fn zero_files_still_produce_init_and_complete() {
    let harness = harness_with(StubProvider::always(valid_invoice()), false).await;
    let events = harness.run(vec![], "invoice").await;

    assert_eq!(events[0]["type"], "init");
    assert_eq!(events.last().unwrap()["type"], "complete");
    assert!(events_of_type(&events, "conversion_progress").is_empty());

    let complete = events.last().unwrap();
    assert_eq!(complete["total_files"], 0);
    assert_eq!(complete["successful"], 0);
    assert_eq!(complete["failed"], 0);
}

#[tokio::test]
async fn unknown_schema_keys_are_rejected_up_front() {
    let harness = harness_with(StubProvider::always(valid_invoice()), false).await;
    let rejected = harness
        .engine
        .process(ProcessRequest {
            files: vec![],
            schema_key: "no_such_schema".to_string(),
            instructions: String::new(),
            model_id: None,
            run_id: None,
        })
        .err()
        .expect("unknown schema must be rejected");
    assert!(rejected.message.contains("no_such_schema"));
}

#[tokio::test]
async fn event_ordering_and_counters_hold_for_mixed_batches() {
    let harness = harness_with(StubProvider::always(valid_invoice()), false).await;
    let good_a = harness.write_file("a.txt", "first document");
    let good_b = harness.write_file("b.md", "second document");
    let bad = harness.write_file("c.xyz", "unconvertible");

    let events = harness
        .run(
            vec![
                FileEntry::direct(&good_a),
                FileEntry::direct(&good_b),
                FileEntry::direct(&bad),
            ],
            "invoice",
        )
        .await;

    // init first, complete last.
    assert_eq!(events[0]["type"], "init");
    assert_eq!(events.last().unwrap()["type"], "complete");

    // One conversion_progress per file, after the phase start.
    assert_eq!(events_of_type(&events, "conversion_progress").len(), 3);
    let phase_start_pos = events
        .iter()
        .position(|e| {
            e["type"] == "phase"
                && e["phase"] == "markdown_conversion"
                && e["status"] == "started"
        })
        .unwrap();
    let first_progress_pos = events
        .iter()
        .position(|e| e["type"] == "conversion_progress")
        .unwrap();
    assert!(phase_start_pos < first_progress_pos);

    // Exactly one primary terminal result per input file.
    let results = events_of_type(&events, "result");
    let primaries = results
        .iter()
        .filter(|r| r["is_primary_result"] == true)
        .count();
    assert_eq!(primaries, 3);

    // Failed-conversion results flush after the AI phase completes.
    let ai_done_pos = events
        .iter()
        .position(|e| {
            e["type"] == "phase"
                && e["phase"] == "ai_processing"
                && e["status"] == "completed"
        })
        .unwrap();
    let unsupported_pos = events
        .iter()
        .position(|e| e["type"] == "result" && e["error_kind"] == "unsupported")
        .unwrap();
    assert!(ai_done_pos < unsupported_pos);

    // successful + failed == total.
    let complete = events.last().unwrap();
    assert_eq!(complete["total_files"], 3);
    assert_eq!(complete["successful"], 2);
    assert_eq!(complete["failed"], 1);

    // The ledger row is terminal.
    let runs = harness.engine.ledger.recent_runs(1, None).await;
    assert_eq!(runs[0]["status"], "completed");
    assert_eq!(runs[0]["total_files"], 3);
}

#[tokio::test]
async fn extraction_failures_carry_humanized_errors() {
    // The provider answers, but the payload doesn't match the schema.
    let harness = harness_with(StubProvider::always(json!({"vendor": 7})), false).await;
    let path = harness.write_file("doc.txt", "contents");

    let events = harness.run(vec![FileEntry::direct(&path)], "invoice").await;
    let results = events_of_type(&events, "result");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["status"], "error");
    assert_eq!(results[0]["error_kind"], "extraction_failed");
    let details = &results[0]["error_details"];
    assert!(details["summary"].as_str().unwrap().contains("validation"));
    assert!(!details["errors"].as_array().unwrap().is_empty());
    assert!(!details["tips"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn lifecycle_releases_uploads_after_the_run() {
    let harness = harness_with(StubProvider::always(valid_invoice()), false).await;
    let path = harness.write_file("doc.txt", "contents");

    let events = harness.run(vec![FileEntry::direct(&path)], "invoice").await;
    assert_eq!(events.last().unwrap()["type"], "complete");

    // All references dropped; the file survives under stream_complete until
    // it ages out.
    assert_eq!(harness.engine.lifecycle.ref_count(&path), 0);
    assert!(path.exists());
}
