use std::fs;
use std::path::Path;
use std::time::Duration;

use funchost_config::LanguageWorkerConfig;
use funchost_domain::{FileChangeKind, FunctionMetadataProvider, ScriptEvent};
use funchost_infrastructure::{
    EventFilter, FileEventSource, FileSystemMetadataProvider, ScriptEventManager,
};
use tempfile::TempDir;

fn write_function(root: &Path, name: &str, script: &str) {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("function.json"),
        r#"{"bindings": [
            {"name": "req", "type": "httpTrigger", "direction": "in"},
            {"name": "$return", "type": "http", "direction": "out"}
        ]}"#,
    )
    .unwrap();
    fs::write(dir.join(script), "// handler").unwrap();
}

fn python() -> LanguageWorkerConfig {
    LanguageWorkerConfig {
        language: "python".to_string(),
        executable: "python3".to_string(),
        arguments: Vec::new(),
        worker_path: None,
        extensions: vec![".py".to_string()],
    }
}

#[tokio::test]
async fn test_mixed_language_app_is_partitioned_by_extension() {
    let root = TempDir::new().unwrap();
    write_function(root.path(), "NodeHttp", "index.js");
    write_function(root.path(), "PyHttp", "__init__.py");
    write_function(root.path(), "Skipped", "index.js");

    let allowlist = vec!["NodeHttp".to_string(), "PyHttp".to_string()];
    let result = FileSystemMetadataProvider::new()
        .read_functions_metadata(
            root.path(),
            Some(allowlist.as_slice()),
            &[LanguageWorkerConfig::node(), python()],
        )
        .await
        .unwrap();

    let languages: Vec<_> = result
        .functions
        .iter()
        .map(|f| (f.name.as_str(), f.language.as_str()))
        .collect();
    assert_eq!(languages, vec![("NodeHttp", "node"), ("PyHttp", "python")]);
    assert!(result.errors.is_empty());

    let ids: std::collections::HashSet<_> =
        result.functions.iter().map(|f| f.function_id.clone()).collect();
    assert_eq!(ids.len(), 2);
}

#[tokio::test]
async fn test_watcher_reports_deleted_function_files() {
    let root = TempDir::new().unwrap();
    write_function(root.path(), "HttpTrigger", "index.js");

    let bus = ScriptEventManager::new();
    let mut changes = bus.subscribe(EventFilter::FileChanged);
    let _watcher = FileEventSource::start(root.path(), bus.clone()).unwrap();

    fs::remove_file(root.path().join("HttpTrigger").join("index.js")).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let mut deleted = false;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, changes.recv()).await {
        if let ScriptEvent::FileChanged(change) = event {
            if change.path.ends_with("index.js") && change.change == FileChangeKind::Deleted {
                deleted = true;
                break;
            }
        }
    }
    assert!(deleted);
}
