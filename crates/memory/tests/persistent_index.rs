#![allow(clippy::unwrap_used)]

use std::{path::Path, sync::Arc};

use {
    async_trait::async_trait,
    memdex_memory::{
        MemoryConfig, MemoryManager, SearchOptions, SyncOptions,
        embeddings::EmbeddingProvider,
        store::MemoryStore,
        store_sqlite::SqliteMemoryStore,
    },
    tempfile::TempDir,
    tokio_util::sync::CancellationToken,
    tracing_subscriber::EnvFilter,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One dimension per letter a-z, counting occurrences.
struct LetterEmbedder {
    model: &'static str,
}

#[async_trait]
impl EmbeddingProvider for LetterEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut v = vec![0.0; 26];
        for c in text.to_ascii_lowercase().bytes().filter(u8::is_ascii_lowercase) {
            v[(c - b'a') as usize] += 1.0;
        }
        Ok(v)
    }

    fn model_name(&self) -> &str {
        self.model
    }

    fn dimensions(&self) -> usize {
        26
    }
}

fn write_config(tmp: &Path) -> MemoryConfig {
    let raw = format!(
        r#"
[memory]
db_path = "{db}"
memory_dir = "{mem}"
sessions_dir = "{sessions}"
chunk_tokens = 60
chunk_overlap = 12
"#,
        db = tmp.join("state/memory.db").display(),
        mem = tmp.join("memory").display(),
        sessions = tmp.join("memory/sessions").display(),
    );
    let path = tmp.join("memdex.toml");
    std::fs::write(&path, raw).unwrap();
    MemoryConfig::load(&path).unwrap()
}

async fn manager_with(config: &MemoryConfig, model: &'static str) -> MemoryManager {
    let store: Arc<dyn MemoryStore> = Arc::new(SqliteMemoryStore::open(&config.db_path).await.unwrap());
    MemoryManager::new(config.clone(), store, Some(Arc::new(LetterEmbedder { model }))).unwrap()
}

#[tokio::test]
async fn index_survives_restart() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let config = write_config(tmp.path());
    std::fs::create_dir_all(tmp.path().join("memory/sessions")).unwrap();
    std::fs::create_dir_all(tmp.path().join("state")).unwrap();
    std::fs::write(tmp.path().join("memory/a.md"), "# Deploys\nThe deploy key rotates every Friday.").unwrap();
    std::fs::write(tmp.path().join("memory/sessions/s1.md"), "user: hello\nassistant: hi").unwrap();

    {
        let manager = manager_with(&config, "letters-v1").await;
        let report = manager
            .sync(SyncOptions::default(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.files_indexed, 2);
    }

    let manager = manager_with(&config, "letters-v1").await;
    let report = manager
        .sync(SyncOptions::default(), None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.files_indexed, 0);
    assert_eq!(report.files_unchanged, 2);
    assert!(!report.full);

    let results = manager
        .search("deploy key", &SearchOptions { min_score: 0.0, ..Default::default() }, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(results[0].path, "a.md");

    let status = manager.status().await.unwrap();
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["memory_files"], 1);
    assert_eq!(json["session_files"], 1);
    assert_eq!(json["embedding_model"], "letters-v1");
    assert!(status.db_size_bytes.is_some());
}

#[tokio::test]
async fn switching_models_reindexes_everything() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let config = write_config(tmp.path());
    std::fs::create_dir_all(tmp.path().join("memory")).unwrap();
    std::fs::create_dir_all(tmp.path().join("state")).unwrap();
    std::fs::write(tmp.path().join("memory/a.md"), "alpha").unwrap();
    std::fs::write(tmp.path().join("memory/b.md"), "bravo").unwrap();

    manager_with(&config, "letters-v1")
        .await
        .sync(SyncOptions::default(), None, &CancellationToken::new())
        .await
        .unwrap();

    let report = manager_with(&config, "letters-v2")
        .await
        .sync(SyncOptions::default(), None, &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.full);
    assert_eq!(report.files_indexed, 2);
    assert_eq!(report.cache_hits, 0);
}

#[tokio::test]
async fn open_from_config_runs_keyword_only() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let config = write_config(tmp.path());
    std::fs::create_dir_all(tmp.path().join("memory")).unwrap();
    std::fs::write(tmp.path().join("memory/todo.txt"), "renew the TLS certificate").unwrap();
    std::fs::write(tmp.path().join("memory/groceries.md"), "eggs and milk").unwrap();
    std::fs::write(tmp.path().join("memory/books.md"), "finish the novel").unwrap();
    for i in 0..6 {
        std::fs::write(tmp.path().join(format!("memory/day-{i}.md")), "nothing much happened").unwrap();
    }

    let manager = MemoryManager::open(config).await.unwrap();
    manager
        .sync(SyncOptions::default(), None, &CancellationToken::new())
        .await
        .unwrap();
    let results = manager
        .search("certificate", &manager.default_search_options(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].path, "todo.txt");
    assert!(results[0].score >= manager.config().min_score);
    assert!(tmp.path().join("state/memory.db").exists());
}
