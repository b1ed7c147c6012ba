use std::fs;

use crate::{MemoryError, MemoryManager, ProviderSelection, ReadFileOptions};

use super::support::{test_config, EmbeddingServer};

fn assert_denied(result: anyhow::Result<String>) {
    let error = result.expect_err("access should be denied");
    assert!(
        matches!(
            error.downcast_ref::<MemoryError>(),
            Some(MemoryError::PathDenied(_))
        ),
        "expected PathDenied, got: {error:#}"
    );
}

#[tokio::test]
async fn read_file_is_confined_to_allowed_roots() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let memory_dir = workspace.path().join("memory");
    fs::create_dir_all(&memory_dir).expect("memory dir");
    let body: String = (1..=10).map(|n| format!("line{n}\n")).collect();
    fs::write(memory_dir.join("notes.md"), &body).expect("write notes");

    let server = EmbeddingServer::start().await;
    let config = test_config(workspace.path(), &server.url());
    let manager = MemoryManager::get_or_create(config).await.expect("manager");

    assert_denied(manager.read_file(&ReadFileOptions {
        rel_path: "../../etc/passwd".to_string(),
        ..Default::default()
    }));

    assert_denied(manager.read_file(&ReadFileOptions {
        rel_path: "../../../etc/shadow.md".to_string(),
        ..Default::default()
    }));

    assert_denied(manager.read_file(&ReadFileOptions {
        rel_path: "memory/notes.txt".to_string(),
        ..Default::default()
    }));

    let full = manager
        .read_file(&ReadFileOptions {
            rel_path: "memory/notes.md".to_string(),
            ..Default::default()
        })
        .expect("read whole file");
    assert_eq!(full, body);

    let slice = manager
        .read_file(&ReadFileOptions {
            rel_path: "memory/notes.md".to_string(),
            from: Some(5),
            lines: Some(2),
        })
        .expect("read slice");
    assert_eq!(slice, "line5\nline6");

    manager.close().await.expect("close");
}

#[cfg(unix)]
#[tokio::test]
async fn read_file_rejects_symlinks() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let outside = tempfile::tempdir().expect("outside dir");
    let memory_dir = workspace.path().join("memory");
    fs::create_dir_all(&memory_dir).expect("memory dir");

    let target = outside.path().join("secret.md");
    fs::write(&target, "secret").expect("write target");
    std::os::unix::fs::symlink(&target, memory_dir.join("link.md")).expect("symlink");

    let server = EmbeddingServer::start().await;
    let config = test_config(workspace.path(), &server.url());
    let manager = MemoryManager::get_or_create(config).await.expect("manager");

    assert_denied(manager.read_file(&ReadFileOptions {
        rel_path: "memory/link.md".to_string(),
        ..Default::default()
    }));

    manager.close().await.expect("close");
}

#[tokio::test]
async fn read_file_allows_configured_extra_paths() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let extra = tempfile::tempdir().expect("extra dir");
    fs::write(extra.path().join("handbook.md"), "from the extra root").expect("write extra");

    let server = EmbeddingServer::start().await;
    let mut config = test_config(workspace.path(), &server.url());
    config.extra_paths = vec![extra.path().to_path_buf()];

    let manager = MemoryManager::get_or_create(config).await.expect("manager");

    let content = manager
        .read_file(&ReadFileOptions {
            rel_path: extra
                .path()
                .join("handbook.md")
                .to_string_lossy()
                .into_owned(),
            ..Default::default()
        })
        .expect("read extra file");
    assert_eq!(content, "from the extra root");

    // A sibling of the extra root is still out of bounds.
    assert_denied(manager.read_file(&ReadFileOptions {
        rel_path: extra
            .path()
            .parent()
            .expect("parent")
            .join("outside.md")
            .to_string_lossy()
            .into_owned(),
        ..Default::default()
    }));

    manager.close().await.expect("close");
}

#[tokio::test]
async fn registry_hands_out_one_manager_per_settings() {
    let workspace = tempfile::tempdir().expect("tempdir");
    fs::write(workspace.path().join("MEMORY.md"), "note").expect("write memory");

    let server = EmbeddingServer::start().await;
    let config = test_config(workspace.path(), &server.url());

    let first = MemoryManager::get_or_create(config.clone())
        .await
        .expect("first");
    let second = MemoryManager::get_or_create(config.clone())
        .await
        .expect("second");
    assert!(
        std::sync::Arc::ptr_eq(&first, &second),
        "same settings share one manager"
    );

    first.close().await.expect("close");

    let third = MemoryManager::get_or_create(config).await.expect("third");
    assert!(
        !std::sync::Arc::ptr_eq(&first, &third),
        "close evicts the registry entry"
    );
    third.close().await.expect("close");
}

#[tokio::test]
async fn auto_selection_reports_every_skipped_provider() {
    std::env::remove_var("OPENAI_API_KEY");
    std::env::remove_var("GEMINI_API_KEY");
    std::env::remove_var("GOOGLE_API_KEY");

    let workspace = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(workspace.path(), "http://unused.invalid");
    config.provider.selection = ProviderSelection::Auto;
    config.provider.openai.api_key = None;

    let error = MemoryManager::get_or_create(config)
        .await
        .expect_err("no provider should be constructible");
    let message = format!("{error:#}");
    assert!(message.contains("no embedding provider available"));
    assert!(message.contains("openai"));
    assert!(message.contains("gemini"));
}

#[tokio::test]
async fn status_reflects_store_and_provider_state() {
    let workspace = tempfile::tempdir().expect("tempdir");
    fs::write(workspace.path().join("MEMORY.md"), "status check note").expect("write memory");

    let server = EmbeddingServer::start().await;
    let config = test_config(workspace.path(), &server.url());
    let manager = MemoryManager::get_or_create(config).await.expect("manager");

    let before = manager.status().await.expect("status");
    assert_eq!(before.provider, "openai");
    assert_eq!(before.model, "test-embed");
    assert!(before.dirty, "fresh manager starts dirty");
    assert_eq!(before.memory_files, 0);

    manager
        .sync(crate::SyncOptions::default())
        .await
        .expect("sync");

    let after = manager.status().await.expect("status");
    assert_eq!(after.memory_files, 1);
    assert!(after.memory_chunks >= 1);
    assert!(after.fts_available);
    assert!(after.fingerprint.is_some());
    assert!(manager.probe_embedding_availability().await);

    manager.close().await.expect("close");
}
