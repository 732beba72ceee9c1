#![allow(dead_code)]

use relay_agent::{
    BridgeConfig, BridgeEvent, ConversationEvent, EventReceiver, Manifest, ManifestRegistry,
    load_manifest_file,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const INIT_S1: &str = r#"{"type":"system","subtype":"init","session_id":"s1"}"#;
pub const RESULT_42: &str = r#"{"type":"result","session_id":"s1","result":"42","is_error":false}"#;

/// Writes a manifest whose agent is `sh -c <script>`; an argument-mode prompt
/// arrives as `$1` after any flags.
pub fn write_sh_manifest(dir: &Path, name: &str, extra: serde_json::Value, script: &str) {
    let mut descriptor = json!({
        "name": name,
        "command": "sh",
        "args": ["-c", script, name],
    });
    if let (Some(target), Some(extra)) = (descriptor.as_object_mut(), extra.as_object()) {
        for (key, value) in extra {
            target.insert(key.clone(), value.clone());
        }
    }
    std::fs::write(
        dir.join(format!("{name}.json")),
        serde_json::to_vec_pretty(&descriptor).expect("manifest should serialize"),
    )
    .expect("manifest write should succeed");
}

pub fn sh_manifest(dir: &Path, name: &str, extra: serde_json::Value, script: &str) -> Arc<Manifest> {
    write_sh_manifest(dir, name, extra, script);
    Arc::new(
        load_manifest_file(&dir.join(format!("{name}.json"))).expect("manifest should load"),
    )
}

/// Script printing the given JSON lines, one per stdout line.
pub fn print_lines(lines: &[&str]) -> String {
    lines
        .iter()
        .map(|line| format!("printf '%s\\n' '{line}'"))
        .collect::<Vec<_>>()
        .join("; ")
}

pub fn test_config(working_dir: &Path) -> BridgeConfig {
    BridgeConfig {
        default_engine: "echo-agent".to_string(),
        working_dir: working_dir.to_path_buf(),
        termination_grace_ms: 300,
        ..BridgeConfig::default()
    }
}

pub fn load_registry(dir: &Path) -> ManifestRegistry {
    ManifestRegistry::load_dir(dir).expect("manifest directory should load")
}

pub async fn recv_within<E>(rx: &mut EventReceiver<E>, timeout: Duration) -> Option<E> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

/// Collects conversation events until `done` matches one, or the timeout hits.
pub async fn collect_until(
    rx: &mut EventReceiver<ConversationEvent>,
    timeout: Duration,
    mut done: impl FnMut(&ConversationEvent) -> bool,
) -> Vec<ConversationEvent> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut seen = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        let finished = done(&event);
        seen.push(event);
        if finished {
            break;
        }
    }
    seen
}

pub fn drain_now<E>(rx: &mut EventReceiver<E>) -> Vec<E> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn kinds(events: &[BridgeEvent]) -> Vec<&'static str> {
    events.iter().map(BridgeEvent::kind).collect()
}

pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
