use std::fs;

use crossprompt::memory::{
    ArtifactKey, FullRunArtifacts, JsonFileMemoryStore, Memory, MemoryStore, StorageError,
};
use tempfile::tempdir;

fn artifacts(tag: &str) -> FullRunArtifacts {
    FullRunArtifacts {
        task: format!("task {tag}"),
        web_context: format!("ctx {tag}"),
        summary: format!("summary {tag}"),
        plan: format!("plan {tag}"),
        evaluation: format!("evaluation {tag}"),
    }
}

#[test]
fn missing_file_loads_as_empty_memory() {
    let dir = tempdir().unwrap();
    let store = JsonFileMemoryStore::new(dir.path().join("memory.json"));
    let memory = store.load().unwrap();
    assert!(memory.is_empty());
    assert_eq!(memory.get(ArtifactKey::Plan), "");
}

#[test]
fn commit_then_load_returns_the_same_memory() {
    let dir = tempdir().unwrap();
    let store = JsonFileMemoryStore::new(dir.path().join("nested/memory.json"));
    let memory = Memory::new().with_full_run(&artifacts("one"));

    store.commit(&memory).unwrap();
    assert_eq!(store.load().unwrap(), memory);
    assert!(!dir.path().join("nested/memory.json.tmp").exists());
}

#[test]
fn two_loads_without_commit_are_equal() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("memory.json");
    fs::write(&path, r#"{"task": "T", "summary": "S0", "plan": "P0"}"#).unwrap();

    let store = JsonFileMemoryStore::new(&path);
    assert_eq!(store.load().unwrap(), store.load().unwrap());
}

#[test]
fn file_is_pretty_printed_with_unescaped_unicode() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("memory.json");
    let store = JsonFileMemoryStore::new(&path);

    let mut memory = Memory::new();
    memory.set(ArtifactKey::Summary, "Avaliação crítica");
    store.commit(&memory).unwrap();

    let raw = fs::read_to_string(&path).unwrap();
    assert_eq!(raw, "{\n    \"summary\": \"Avaliação crítica\"\n}\n");
}

#[test]
fn malformed_file_is_unavailable_and_left_untouched() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("memory.json");

    for bad in ["{not json", r#"["a", "b"]"#, r#"{"summary": 3}"#] {
        fs::write(&path, bad).unwrap();
        let store = JsonFileMemoryStore::new(&path);

        let err = store.load().unwrap_err();
        assert!(matches!(err, StorageError::Unavailable { .. }), "{bad}");

        let (memory, warning) = store.load_or_empty();
        assert!(memory.is_empty());
        assert!(warning.is_some());
        assert_eq!(fs::read_to_string(&path).unwrap(), bad);
    }
}

#[test]
fn failed_commit_keeps_previous_durable_state() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("memory.json");
    let store = JsonFileMemoryStore::new(&path);

    let before = Memory::new().with_full_run(&artifacts("before"));
    store.commit(&before).unwrap();
    let raw_before = fs::read(&path).unwrap();

    // A directory where the temp file should go makes the write fail.
    fs::create_dir(dir.path().join("memory.json.tmp")).unwrap();

    let after = before.with_full_run(&artifacts("after"));
    let err = store.commit(&after).unwrap_err();
    assert!(matches!(err, StorageError::Write { .. }));

    assert_eq!(fs::read(&path).unwrap(), raw_before);
    assert_eq!(store.load().unwrap(), before);
}

#[test]
fn foreign_keys_survive_a_commit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("memory.json");
    fs::write(&path, r#"{"notes": "kept", "summary": "old"}"#).unwrap();
    let store = JsonFileMemoryStore::new(&path);

    let next = store.load().unwrap().with_full_run(&artifacts("new"));
    store.commit(&next).unwrap();

    let reloaded = store.load().unwrap();
    assert_eq!(reloaded.get(ArtifactKey::Summary), "summary new");
    assert!(reloaded.entries().any(|(k, v)| k == "notes" && v == "kept"));
}
