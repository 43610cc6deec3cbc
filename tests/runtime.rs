//! End-to-end tests through `Runtime`: file loading, SQLite persistence,
//! checkpoints and configuration rebuilds.

use std::fs;
use std::path::{Path, PathBuf};

use ragweave::config::{Config, StoreProvider};
use ragweave::runtime::Runtime;
use ragweave_core::models::{Modality, ModalityPair, QueryInput, RetrievalMode};
use ragweave_core::Error;
use tempfile::TempDir;

fn config_toml(workspace: &Path, store: &str) -> String {
    format!(
        r#"
[general]
knowledge_base = "notes"
workspace_dir = "{}"
modality_fallback = false

[stores]
vector = "{store}"
document = "{store}"
cache = "{store}"

[embedding.text]
provider = "hashing"
dims = 256

[embedding.audio]
provider = "hashing"
dims = 64

[ingest]
chunk_size = 40
chunk_overlap = 4
retry_backoff_ms = 1
"#,
        workspace.display()
    )
}

fn config(workspace: &Path, store: &str) -> Config {
    Config::from_toml_str(&config_toml(workspace, store)).unwrap()
}

/// Three topic files plus one audio clip under `<tmp>/files`.
fn write_files(root: &Path) -> PathBuf {
    let files = root.join("files");
    fs::create_dir_all(&files).unwrap();
    fs::write(
        files.join("rust.md"),
        "# Rust\n\nThe borrow checker enforces ownership rules at compile time.",
    )
    .unwrap();
    fs::write(
        files.join("bread.md"),
        "# Bread\n\nA sourdough starter ferments flour and water for days.",
    )
    .unwrap();
    fs::write(
        files.join("astro.txt"),
        "Pulsars are rotating neutron stars that emit beams of radiation.",
    )
    .unwrap();
    fs::write(files.join("chime.wav"), b"RIFF\x24\x00\x00\x00WAVEfmt chime").unwrap();
    files
}

fn text(q: &str) -> QueryInput {
    QueryInput::Text(q.to_string())
}

const TEXT: ModalityPair = ModalityPair {
    source: Modality::Text,
    target: Modality::Text,
};

#[tokio::test]
async fn test_ingest_directory_and_query() {
    let tmp = TempDir::new().unwrap();
    let files = write_files(tmp.path());
    let runtime = Runtime::init(config(tmp.path(), "memory")).await.unwrap();

    let report = runtime.ingest_path(&files).await;
    assert_eq!(report.accepted, 4, "{:?}", report.errors);
    assert_eq!(report.failed, 0);

    let hits = runtime.query(TEXT, &text("borrow checker ownership"), 3).await.unwrap();
    assert!(hits[0].source.ends_with("rust.md"));
    assert!(hits[0].text.contains("borrow checker"));

    let again = runtime.ingest_path(&files).await;
    assert_eq!((again.accepted, again.skipped), (0, 4));
}

#[tokio::test]
async fn test_audio_space_answers_text_queries() {
    let tmp = TempDir::new().unwrap();
    let files = write_files(tmp.path());
    let runtime = Runtime::init(config(tmp.path(), "memory")).await.unwrap();
    runtime.ingest_path(files.join("chime.wav")).await;

    let hits = runtime
        .query(ModalityPair::text_to(Modality::Audio), &text("chime"), 5)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].text, "chime.wav");

    let err = runtime
        .query_with_mode(
            ModalityPair::text_to(Modality::Audio),
            &text("chime"),
            5,
            RetrievalMode::Bm25Only,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
}

#[tokio::test]
async fn test_path_list_reports_missing_entries() {
    let tmp = TempDir::new().unwrap();
    let files = write_files(tmp.path());
    let list = tmp.path().join("sources.txt");
    fs::write(
        &list,
        format!(
            "# sources\n{}\n\n{}\n",
            files.join("rust.md").display(),
            files.join("missing.md").display()
        ),
    )
    .unwrap();

    let runtime = Runtime::init(config(tmp.path(), "memory")).await.unwrap();
    let report = runtime.ingest_path_list(&list).await;
    assert_eq!((report.accepted, report.failed), (1, 1));
    assert!(report.errors[0].location.ends_with("missing.md"));

    let missing_list = runtime.ingest_path_list(tmp.path().join("nope.txt")).await;
    assert_eq!(missing_list.failed, 1);
}

#[tokio::test]
async fn test_unreachable_url_is_a_failed_unit() {
    let tmp = TempDir::new().unwrap();
    let runtime = Runtime::init(config(tmp.path(), "memory")).await.unwrap();
    let report = runtime.ingest_url("http://127.0.0.1:9/page.html").await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors[0].code, "PROVIDER");
}

#[tokio::test]
async fn test_sqlite_stores_and_checkpoint_survive_restart() {
    let tmp = TempDir::new().unwrap();
    let files = write_files(tmp.path());

    {
        let runtime = Runtime::init(config(tmp.path(), "sqlite")).await.unwrap();
        let report = runtime.ingest_path(&files).await;
        assert_eq!(report.accepted, 4, "{:?}", report.errors);
    }

    let kb_dir = tmp.path().join("notes");
    assert!(kb_dir.join("store.sqlite").exists());
    assert!(kb_dir.join("checkpoint.json").exists());

    let runtime = Runtime::init(config(tmp.path(), "sqlite")).await.unwrap();
    let report = runtime.ingest_path(&files).await;
    assert_eq!((report.accepted, report.skipped), (0, 4));

    let hits = runtime.query(TEXT, &text("sourdough starter"), 3).await.unwrap();
    assert!(hits[0].source.ends_with("bread.md"));
}

#[tokio::test]
async fn test_checkpoint_is_cleared_when_database_is_lost() {
    let tmp = TempDir::new().unwrap();
    let files = write_files(tmp.path());

    {
        let runtime = Runtime::init(config(tmp.path(), "sqlite")).await.unwrap();
        runtime.ingest_path(&files).await;
    }
    let kb_dir = tmp.path().join("notes");
    for entry in fs::read_dir(&kb_dir).unwrap() {
        let path = entry.unwrap().path();
        if path.to_string_lossy().contains("store.sqlite") {
            fs::remove_file(path).unwrap();
        }
    }

    let runtime = Runtime::init(config(tmp.path(), "sqlite")).await.unwrap();
    let report = runtime.ingest_path(&files).await;
    assert_eq!(report.accepted, 4);
}

#[tokio::test]
async fn test_delete_source_through_runtime() {
    let tmp = TempDir::new().unwrap();
    let files = write_files(tmp.path());
    let runtime = Runtime::init(config(tmp.path(), "sqlite")).await.unwrap();
    runtime.ingest_path(&files).await;

    let location = files.join("astro.txt").display().to_string();
    assert!(runtime.delete_source(&location).await.unwrap() > 0);
    let hits = runtime
        .query_with_mode(TEXT, &text("pulsars neutron"), 5, RetrievalMode::Bm25Only)
        .await
        .unwrap();
    assert!(hits.is_empty());

    // Not masked by the checkpoint.
    let report = runtime.ingest_path(&location).await;
    assert_eq!(report.accepted, 1);
}

#[tokio::test]
async fn test_rebuild_swaps_stores_without_disturbing_snapshots() {
    let tmp = TempDir::new().unwrap();
    let files = write_files(tmp.path());
    let runtime = Runtime::init(config(tmp.path(), "memory")).await.unwrap();
    runtime.ingest_path(&files).await;

    let before = runtime.snapshot();
    runtime.rebuild_with(config(tmp.path(), "sqlite")).await.unwrap();
    assert_eq!(runtime.config().stores.vector, StoreProvider::Sqlite);

    let old_hits = before
        .engine()
        .query(TEXT, &text("neutron stars"), 3)
        .await
        .unwrap();
    assert!(old_hits[0].source.ends_with("astro.txt"));

    let new_hits = runtime.query(TEXT, &text("neutron stars"), 3).await.unwrap();
    assert!(new_hits.is_empty());
}

#[tokio::test]
async fn test_rebuild_keeps_unchanged_stores() {
    let tmp = TempDir::new().unwrap();
    let files = write_files(tmp.path());
    let runtime = Runtime::init(config(tmp.path(), "memory")).await.unwrap();
    runtime.ingest_path(&files).await;

    let mut next = config(tmp.path(), "memory");
    next.retrieval.lambda_vector = 0.9;
    next.retrieval.lambda_bm25 = 0.1;
    runtime.rebuild_with(next).await.unwrap();

    assert_eq!(runtime.config().retrieval.lambda_vector, 0.9);
    let hits = runtime.query(TEXT, &text("sourdough"), 3).await.unwrap();
    assert!(hits[0].source.ends_with("bread.md"));
}

#[tokio::test]
async fn test_invalid_rebuild_keeps_previous_config() {
    let tmp = TempDir::new().unwrap();
    let runtime = Runtime::init(config(tmp.path(), "memory")).await.unwrap();

    let mut bad = config(tmp.path(), "sqlite");
    bad.ingest.chunk_overlap = bad.ingest.chunk_size;
    let err = runtime.rebuild_with(bad).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert_eq!(runtime.config().stores.vector, StoreProvider::Memory);
}

#[tokio::test]
async fn test_rebuild_rereads_config_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("ragweave.toml");
    fs::write(&path, config_toml(tmp.path(), "memory")).unwrap();
    let runtime = Runtime::from_path(&path).await.unwrap();

    fs::write(
        &path,
        config_toml(tmp.path(), "memory").replace("knowledge_base = \"notes\"", "knowledge_base = \"other\""),
    )
    .unwrap();
    runtime.rebuild().await.unwrap();
    assert_eq!(runtime.config().general.knowledge_base, "other");

    fs::write(&path, "[ingest]\nchunk_size = 0\n").unwrap();
    assert!(runtime.rebuild().await.is_err());
    assert_eq!(runtime.config().general.knowledge_base, "other");

    let in_memory = Runtime::init(config(tmp.path(), "memory")).await.unwrap();
    assert!(matches!(in_memory.rebuild().await, Err(Error::Config(_))));
}

/// Vector and document membership of every space in the current state.
async fn memberships(runtime: &Runtime) -> Vec<(Modality, usize, usize)> {
    let state = runtime.snapshot();
    let mut out = Vec::new();
    for space in state.orchestrator().spaces() {
        out.push((
            space.modality,
            space.stores.vector.len().await.unwrap(),
            space.stores.document.len().await.unwrap(),
        ));
    }
    out
}

#[tokio::test]
async fn test_switching_one_store_backend_keeps_memberships_equal() {
    let tmp = TempDir::new().unwrap();
    let files = write_files(tmp.path());
    let runtime = Runtime::init(config(tmp.path(), "memory")).await.unwrap();
    runtime.ingest_path(&files).await;

    let mut vector_only = config(tmp.path(), "memory");
    vector_only.stores.vector = StoreProvider::Sqlite;
    runtime.rebuild_with(vector_only).await.unwrap();
    for (modality, vectors, documents) in memberships(&runtime).await {
        assert_eq!(vectors, documents, "{modality}");
    }

    // Durable vectors without their documents are dropped on open.
    let durable = TempDir::new().unwrap();
    let files = write_files(durable.path());
    let runtime = Runtime::init(config(durable.path(), "sqlite")).await.unwrap();
    runtime.ingest_path(&files).await;
    let mut document_in_memory = config(durable.path(), "sqlite");
    document_in_memory.stores.document = StoreProvider::Memory;
    runtime.rebuild_with(document_in_memory).await.unwrap();
    for (modality, vectors, documents) in memberships(&runtime).await {
        assert_eq!((vectors, documents), (0, 0), "{modality}");
    }

    let report = runtime.ingest_path(&files).await;
    assert_eq!(report.accepted, 4, "{:?}", report.errors);
    let hits = runtime.query(TEXT, &text("sourdough starter"), 3).await.unwrap();
    assert!(hits[0].source.ends_with("bread.md"));
    assert!(hits.iter().all(|h| !h.text.is_empty()));
}

#[tokio::test]
async fn test_queries_in_flight_during_rebuild_complete() {
    let tmp = TempDir::new().unwrap();
    let files = write_files(tmp.path());
    let runtime = Runtime::init(config(tmp.path(), "memory")).await.unwrap();
    runtime.ingest_path(&files).await;

    let queries = async {
        let mut results = Vec::new();
        for _ in 0..25 {
            results.push(runtime.query(TEXT, &text("neutron stars"), 3).await);
            tokio::task::yield_now().await;
        }
        results
    };
    let rebuilds = async {
        for store in ["sqlite", "memory", "sqlite"] {
            runtime.rebuild_with(config(tmp.path(), store)).await.unwrap();
            tokio::task::yield_now().await;
        }
    };
    let first_query = text("neutron stars");
    let (started_before, (results, ())) = tokio::join!(
        runtime.query(TEXT, &first_query, 3),
        async { tokio::join!(queries, rebuilds) }
    );

    let started_before = started_before.unwrap();
    assert!(started_before[0].source.ends_with("astro.txt"));
    for result in results {
        let hits = result.unwrap();
        assert!(hits.iter().all(|h| !h.text.is_empty() && !h.source.is_empty()));
    }
    assert_eq!(runtime.config().stores.vector, StoreProvider::Sqlite);
}

#[tokio::test]
async fn test_knowledge_base_name_starting_with_digit() {
    let tmp = TempDir::new().unwrap();
    let files = write_files(tmp.path());
    let toml = config_toml(tmp.path(), "sqlite")
        .replace("knowledge_base = \"notes\"", "knowledge_base = \"2024notes\"");
    let runtime = Runtime::init(Config::from_toml_str(&toml).unwrap()).await.unwrap();

    let report = runtime.ingest_path(&files).await;
    assert_eq!(report.accepted, 4, "{:?}", report.errors);
    assert!(tmp.path().join("2024notes").join("store.sqlite").exists());
    let hits = runtime.query(TEXT, &text("pulsars"), 1).await.unwrap();
    assert!(hits[0].source.ends_with("astro.txt"));

    let escaping = config_toml(tmp.path(), "sqlite")
        .replace("knowledge_base = \"notes\"", "knowledge_base = \"../outside\"");
    assert!(matches!(
        Config::from_toml_str(&escaping),
        Err(Error::Config(_))
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn test_unreadable_file_fails_alone_in_directory_ingest() {
    let tmp = TempDir::new().unwrap();
    let files = write_files(tmp.path());
    std::os::unix::fs::symlink(files.join("gone.md"), files.join("dangling.md")).unwrap();

    let mut config = config(tmp.path(), "memory");
    config.loader.follow_symlinks = true;
    let runtime = Runtime::init(config).await.unwrap();

    let report = runtime.ingest_path(&files).await;
    assert_eq!((report.accepted, report.failed), (4, 1), "{:?}", report.errors);
    assert!(report.errors[0].location.ends_with("dangling.md"));
    assert_eq!(report.errors[0].code, "INVALID_REQUEST");
}
