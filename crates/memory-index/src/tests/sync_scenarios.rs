use std::fs;

use crate::{MemoryManager, ProviderSelection, SyncOptions};

use super::support::{
    failing_embedding_server, open_raw, test_config, EmbeddingServer, GeminiServer,
};
use super::support::chunk_ids;

const THREE_PARAGRAPHS: &str = "alpha notes about the project\n\n\
                                beta notes about the roadmap\n\n\
                                gamma notes about the release\n";

#[tokio::test]
async fn first_sync_builds_the_index_and_incremental_appends() {
    let workspace = tempfile::tempdir().expect("tempdir");
    fs::write(workspace.path().join("MEMORY.md"), THREE_PARAGRAPHS).expect("write memory");

    let server = EmbeddingServer::start().await;
    let mut config = test_config(workspace.path(), &server.url());
    // Small windows so each paragraph lands in its own chunk.
    config.chunking.tokens = 40;
    config.chunking.overlap = 0;
    let store_path = config.store_path();

    let manager = MemoryManager::get_or_create(config).await.expect("manager");
    let report = manager.sync(SyncOptions::default()).await.expect("sync");
    assert!(report.full_reindex, "first sync rebuilds from scratch");
    assert_eq!(report.files_indexed, 1);
    assert!(report.chunks_written >= 3);

    let before = chunk_ids(&open_raw(&store_path));
    assert_eq!(before.len(), report.chunks_written);

    // Append a paragraph; unchanged chunks keep their ids.
    let appended = format!("{THREE_PARAGRAPHS}\ndelta notes about the future\n");
    fs::write(workspace.path().join("MEMORY.md"), &appended).expect("append");

    let report = manager.sync(SyncOptions::default()).await.expect("resync");
    assert!(!report.full_reindex, "same fingerprint, incremental run");
    assert_eq!(report.files_indexed, 1);

    let raw = open_raw(&store_path);
    let after = chunk_ids(&raw);
    assert!(after.len() > before.len());
    for id in &before {
        assert!(after.contains(id), "unchanged chunk id {id} must survive");
    }

    let (file_count, stored_hash): (i64, String) = raw
        .query_row(
            "SELECT COUNT(*), MAX(hash) FROM files WHERE source = 'memory'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .expect("file stats");
    assert_eq!(file_count, 1, "still one memory file row");
    assert_eq!(
        stored_hash,
        crate::chunking::hash_content(&appended),
        "file hash tracks the new content"
    );

    manager.close().await.expect("close");
}

#[tokio::test]
async fn unchanged_content_syncs_without_provider_calls() {
    let workspace = tempfile::tempdir().expect("tempdir");
    fs::write(workspace.path().join("MEMORY.md"), THREE_PARAGRAPHS).expect("write memory");

    let server = EmbeddingServer::start().await;
    let config = test_config(workspace.path(), &server.url());
    let store_path = config.store_path();

    let manager = MemoryManager::get_or_create(config).await.expect("manager");
    manager.sync(SyncOptions::default()).await.expect("first sync");
    let calls_after_first = server.call_count();
    let rows_after_first = chunk_ids(&open_raw(&store_path));

    manager.sync(SyncOptions::default()).await.expect("second sync");
    assert_eq!(
        server.call_count(),
        calls_after_first,
        "unchanged content must not re-embed"
    );
    assert_eq!(chunk_ids(&open_raw(&store_path)), rows_after_first);

    manager.close().await.expect("close");
}

#[tokio::test]
async fn deleted_files_leave_the_index() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let memory_path = workspace.path().join("MEMORY.md");
    fs::write(&memory_path, "short lived note").expect("write memory");

    let server = EmbeddingServer::start().await;
    let config = test_config(workspace.path(), &server.url());
    let store_path = config.store_path();

    let manager = MemoryManager::get_or_create(config).await.expect("manager");
    manager.sync(SyncOptions::default()).await.expect("first sync");
    assert_eq!(manager.status().await.expect("status").memory_files, 1);

    fs::remove_file(&memory_path).expect("delete memory file");
    let report = manager.sync(SyncOptions::default()).await.expect("resync");
    assert_eq!(report.files_deleted, 1);

    let status = manager.status().await.expect("status");
    assert_eq!(status.memory_files, 0);
    assert_eq!(status.memory_chunks, 0);
    assert!(chunk_ids(&open_raw(&store_path)).is_empty());

    manager.close().await.expect("close");
}

#[tokio::test]
async fn session_transcripts_are_indexed_under_their_prefix() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let sessions = tempfile::tempdir().expect("sessions dir");
    fs::write(workspace.path().join("MEMORY.md"), "memory body").expect("write memory");
    fs::write(
        sessions.path().join("chat-1.jsonl"),
        concat!(
            "{\"type\":\"message\",\"message\":{\"role\":\"user\",\"content\":\"tell me about the zanzibar rollout\"}}\n",
            "{\"type\":\"message\",\"message\":{\"role\":\"assistant\",\"content\":[{\"type\":\"text\",\"text\":\"the rollout finished\"}]}}\n",
            "not json\n",
        ),
    )
    .expect("write transcript");

    let server = EmbeddingServer::start().await;
    let mut config = test_config(workspace.path(), &server.url());
    config.sessions_dir = Some(sessions.path().to_path_buf());
    let store_path = config.store_path();

    let manager = MemoryManager::get_or_create(config).await.expect("manager");
    manager.sync(SyncOptions::default()).await.expect("sync");

    let status = manager.status().await.expect("status");
    assert_eq!(status.session_files, 1);
    assert!(status.session_chunks >= 1);

    let raw = open_raw(&store_path);
    let (path, text): (String, String) = raw
        .query_row(
            "SELECT path, text FROM chunks WHERE source = 'sessions' LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .expect("session chunk");
    assert!(path.starts_with("sessions/"));
    assert!(text.contains("User: tell me about the zanzibar rollout"));
    assert!(text.contains("Assistant: the rollout finished"));

    manager.close().await.expect("close");
}

#[tokio::test]
async fn changed_settings_force_a_full_reindex() {
    let workspace = tempfile::tempdir().expect("tempdir");
    fs::write(workspace.path().join("MEMORY.md"), THREE_PARAGRAPHS).expect("write memory");

    let server = EmbeddingServer::start().await;
    let config = test_config(workspace.path(), &server.url());
    let store_path = config.store_path();

    let manager = MemoryManager::get_or_create(config.clone())
        .await
        .expect("manager");
    manager.sync(SyncOptions::default()).await.expect("first sync");
    manager.close().await.expect("close");

    let mut changed = config;
    changed.chunking.tokens = 64;
    let manager = MemoryManager::get_or_create(changed).await.expect("manager");
    let report = manager.sync(SyncOptions::default()).await.expect("sync");
    assert!(report.full_reindex, "fingerprint mismatch rebuilds the index");

    let fingerprint = manager
        .status()
        .await
        .expect("status")
        .fingerprint
        .expect("fingerprint present");
    assert_eq!(fingerprint.chunk_tokens, 64);

    // No leftover shadow or backup files after a successful swap.
    let dir = store_path.parent().expect("store dir");
    let leftovers: Vec<String> = fs::read_dir(dir)
        .expect("read store dir")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".tmp-") || name.contains(".backup"))
        .collect();
    assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");

    manager.close().await.expect("close");
}

#[tokio::test]
async fn embedding_failure_switches_to_the_fallback_provider() {
    let workspace = tempfile::tempdir().expect("tempdir");
    fs::write(workspace.path().join("MEMORY.md"), "note about failover").expect("write memory");

    let broken = failing_embedding_server(400, "embedding backend disabled").await;
    let gemini = GeminiServer::start().await;

    let mut config = test_config(workspace.path(), &broken.uri());
    config.provider.fallback = Some(ProviderSelection::Gemini);
    config.provider.gemini.base_url = Some(gemini.url());
    config.provider.gemini.api_key = Some("gemini-key".to_string());

    let manager = MemoryManager::get_or_create(config).await.expect("manager");
    let report = manager.sync(SyncOptions::default()).await.expect("sync");
    assert_eq!(report.reason, "fallback");
    assert!(report.full_reindex);
    assert!(report.files_indexed >= 1);

    let status = manager.status().await.expect("status");
    assert_eq!(status.provider, "gemini");
    let fallback = status.fallback.expect("fallback recorded");
    assert_eq!(fallback.from, "openai");
    assert!(fallback.reason.contains("embedding"));
    assert!(gemini.call_count() >= 1, "fallback provider did the work");

    manager.close().await.expect("close");
}

#[tokio::test]
async fn concurrent_syncs_share_one_underlying_run() {
    let workspace = tempfile::tempdir().expect("tempdir");
    fs::write(workspace.path().join("MEMORY.md"), "one small note").expect("write memory");

    let server = EmbeddingServer::start().await;
    let mut config = test_config(workspace.path(), &server.url());
    // Without the cache, a duplicated run would double the provider calls.
    config.cache.enabled = false;

    let manager = MemoryManager::get_or_create(config).await.expect("manager");
    let (left, right) = tokio::join!(
        manager.sync(SyncOptions::default()),
        manager.sync(SyncOptions::default()),
    );
    let left = left.expect("left sync");
    let right = right.expect("right sync");

    assert_eq!(left.files_indexed, right.files_indexed);
    assert_eq!(server.call_count(), 1, "exactly one embedding call in total");

    manager.close().await.expect("close");
}
