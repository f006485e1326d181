//! End-to-end tests for the ingestion pipeline: discovery through sync,
//! storage, search, and watching, against real files in temp directories.

use scrollback_core::fsys::{Fs, OsFs, SystemClock};
use scrollback_core::store::Deadline;
use scrollback_core::sync::SyncEngine;
use scrollback_core::types::{
    AgentKind, RelationshipType, Role, SessionFilter, SortDirection, Tick,
};
use scrollback_core::watch::WatcherHub;
use scrollback_core::{Config, Store};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn test_config(data_dir: &Path, roots: Vec<(AgentKind, Vec<PathBuf>)>) -> Config {
    let mut config = Config::default();
    config.agent_roots = roots;
    config.data_dir = data_dir.to_path_buf();
    config.db_path = data_dir.join("scrollback.db");
    config.machine = "local".to_string();
    config.poll_interval = Duration::from_millis(30);
    config.heartbeat_interval = Duration::from_millis(300);
    config
}

fn engine_for(config: &Config) -> (Arc<Store>, Arc<SyncEngine>) {
    let store = Arc::new(Store::open(&config.db_path).unwrap());
    let engine = Arc::new(SyncEngine::new(
        store.clone(),
        Arc::new(OsFs),
        Arc::new(SystemClock),
        Arc::new(config.clone()),
    ));
    (store, engine)
}

fn write_lines(path: &Path, lines: &[String]) {
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    std::fs::write(path, out).unwrap();
}

fn pi_header(id: &str, cwd: &str) -> String {
    format!(
        r#"{{"type":"session","id":"{}","cwd":"{}","timestamp":"2025-03-01T09:00:00Z"}}"#,
        id, cwd
    )
}

fn pi_user(text: &str, secs: u32) -> String {
    format!(
        r#"{{"type":"message","timestamp":"2025-03-01T09:00:{:02}Z","message":{{"role":"user","content":"{}"}}}}"#,
        secs, text
    )
}

fn pi_assistant_with_tool(secs: u32) -> String {
    format!(
        r#"{{"type":"message","timestamp":"2025-03-01T09:00:{:02}Z","message":{{"role":"assistant","content":[{{"type":"text","text":"Running."}},{{"type":"toolCall","id":"t1","name":"bash","arguments":{{"cmd":"ls"}}}}]}}}}"#,
        secs
    )
}

fn pi_tool_result(secs: u32) -> String {
    format!(
        r#"{{"role":"toolResult","toolCallId":"t1","timestamp":"2025-03-01T09:00:{:02}Z","content":[{{"type":"text","text":"a.txt"}}]}}"#,
        secs
    )
}

fn claude_user(uuid: &str, parent: Option<&str>, secs: u32, text: &str) -> String {
    serde_json::json!({
        "type": "user",
        "uuid": uuid,
        "parentUuid": parent,
        "sessionId": "x",
        "timestamp": format!("2025-02-01T10:00:{:02}Z", secs),
        "cwd": "/home/u/demo",
        "message": {"role": "user", "content": text}
    })
    .to_string()
}

fn claude_assistant(uuid: &str, parent: &str, secs: u32, text: &str) -> String {
    serde_json::json!({
        "type": "assistant",
        "uuid": uuid,
        "parentUuid": parent,
        "sessionId": "x",
        "timestamp": format!("2025-02-01T10:00:{:02}Z", secs),
        "cwd": "/home/u/demo",
        "message": {
            "role": "assistant",
            "model": "test-model",
            "content": [{"type": "text", "text": text}]
        }
    })
    .to_string()
}

// S1: one Claude file containing a DAG with one branch point produces two
// linked sessions.
#[tokio::test]
async fn claude_branch_yields_two_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("claude");
    std::fs::create_dir_all(&root).unwrap();

    write_lines(
        &root.join("conv.jsonl"),
        &[
            claude_user("u1", None, 0, "root question"),
            claude_assistant("a1", "u1", 5, "first answer"),
            claude_user("u2b", Some("a1"), 10, "branch question"),
            claude_assistant("a2b", "u2b", 15, "branch answer"),
            claude_user("u2", Some("a1"), 20, "main question"),
            claude_assistant("a2", "u2", 25, "main answer"),
        ],
    );

    let config = test_config(dir.path(), vec![(AgentKind::Claude, vec![root])]);
    let (store, engine) = engine_for(&config);

    let stats = engine
        .sync_all(CancellationToken::new(), None)
        .await
        .unwrap();
    assert_eq!(stats.synced, 1);
    assert_eq!(stats.errors, 0);

    let root_session = store.get_session("conv", Deadline::none()).unwrap().unwrap();
    assert_eq!(root_session.relationship, RelationshipType::Root);
    assert_eq!(root_session.message_count, 4);

    let page = store
        .list_sessions(&SessionFilter::default(), None, 10, Deadline::none())
        .unwrap();
    assert_eq!(page.sessions.len(), 2);

    let branch = page
        .sessions
        .iter()
        .find(|s| s.relationship == RelationshipType::Branch)
        .expect("branch session stored");
    assert_eq!(branch.parent_session_id.as_deref(), Some("conv"));
    assert_eq!(branch.agent, AgentKind::Claude);
}

// S2 + S3: a Pi session with a tool call, then an appended compaction event
// picked up by SyncSingleSession and findable through full-text search.
#[tokio::test]
async fn pi_session_tool_call_and_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("pi");
    std::fs::create_dir_all(&root).unwrap();
    let file = root.join("abc.jsonl");

    write_lines(
        &file,
        &[
            pi_header("abc", "/home/u/proj"),
            pi_user("list the files", 1),
            pi_assistant_with_tool(2),
            pi_tool_result(3),
        ],
    );

    let config = test_config(dir.path(), vec![(AgentKind::Pi, vec![root])]);
    let (store, engine) = engine_for(&config);
    engine
        .sync_all(CancellationToken::new(), None)
        .await
        .unwrap();

    let session = store.get_session("abc", Deadline::none()).unwrap().unwrap();
    assert_eq!(session.project, "proj");
    assert_eq!(session.message_count, 3);
    assert_eq!(session.user_message_count, 1);

    let messages = store
        .get_messages("abc", 0, 100, SortDirection::Asc, Deadline::none())
        .unwrap();
    let assistant = &messages[1];
    assert!(assistant.has_tool_use);
    assert!(assistant.content.contains("[Bash cmd=ls]"));
    assert_eq!(assistant.tool_calls.len(), 1);
    assert_eq!(messages[2].role, Role::ToolResult);

    // Append a compaction event and re-sync just this session
    let mut content = std::fs::read_to_string(&file).unwrap();
    content.push_str(r#"{"type":"compaction","summary":"resumed","timestamp":"2025-03-01T09:00:09Z"}"#);
    content.push('\n');
    std::fs::write(&file, content).unwrap();

    engine.sync_single_session("abc").await.unwrap();

    let session = store.get_session("abc", Deadline::none()).unwrap().unwrap();
    assert_eq!(session.message_count, 4);
    let messages = store
        .get_messages("abc", 0, 100, SortDirection::Asc, Deadline::none())
        .unwrap();
    assert_eq!(messages[3].role, Role::User);
    assert_eq!(messages[3].content, "resumed");

    if store.has_fts() {
        let page = store
            .search("resumed", &SessionFilter::default(), None, 10, Deadline::none())
            .unwrap();
        assert_eq!(page.hits.len(), 1);
        assert_eq!(page.hits[0].session_id, "abc");
        assert_eq!(page.hits[0].ordinal, 3);
    }
}

// S4 (scaled down): syncing twice with no filesystem changes skips
// everything on the second pass.
#[tokio::test]
async fn second_sync_skips_unchanged_files() {
    let dir = tempfile::tempdir().unwrap();
    let pi_root = dir.path().join("pi");
    let claude_root = dir.path().join("claude");
    std::fs::create_dir_all(&pi_root).unwrap();
    std::fs::create_dir_all(&claude_root).unwrap();

    for i in 0..20 {
        write_lines(
            &pi_root.join(format!("pi-{:02}.jsonl", i)),
            &[pi_header(&format!("pi-{:02}", i), "/home/u/p"), pi_user("hi", 1)],
        );
    }
    for i in 0..10 {
        write_lines(
            &claude_root.join(format!("cl-{:02}.jsonl", i)),
            &[
                claude_user("u1", None, 0, "hello"),
                claude_assistant("a1", "u1", 1, "hi"),
            ],
        );
    }

    let config = test_config(
        dir.path(),
        vec![
            (AgentKind::Pi, vec![pi_root]),
            (AgentKind::Claude, vec![claude_root]),
        ],
    );
    let (store, engine) = engine_for(&config);

    let first = engine
        .sync_all(CancellationToken::new(), None)
        .await
        .unwrap();
    assert_eq!(first.total, 30);
    assert_eq!(first.synced, 30);
    assert_eq!(first.skipped, 0);
    assert_eq!(first.errors, 0);

    let second = engine
        .sync_all(CancellationToken::new(), None)
        .await
        .unwrap();
    assert_eq!(second.total, 30);
    assert_eq!(second.synced, 0);
    assert_eq!(second.skipped, 30);

    let stats = store.get_stats(Deadline::none()).unwrap();
    assert_eq!(stats.sessions, 30);
}

/// Filesystem wrapper that slows opens down enough to make sync overlap
/// deterministic in the coalescing test.
struct SlowFs(OsFs);

impl Fs for SlowFs {
    fn walk(&self, root: &Path) -> scrollback_core::Result<Vec<PathBuf>> {
        self.0.walk(root)
    }
    fn stat(&self, path: &Path) -> scrollback_core::Result<scrollback_core::fsys::FileInfo> {
        self.0.stat(path)
    }
    fn open(&self, path: &Path) -> scrollback_core::Result<Box<dyn Read + Send>> {
        std::thread::sleep(Duration::from_millis(5));
        self.0.open(path)
    }
}

// S6: a second trigger issued while a sync is running does not start a new
// scan; both callers observe the same terminal stats.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_triggers_coalesce() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("pi");
    std::fs::create_dir_all(&root).unwrap();
    for i in 0..30 {
        write_lines(
            &root.join(format!("s{:02}.jsonl", i)),
            &[pi_header(&format!("s{:02}", i), "/p"), pi_user("hi", 1)],
        );
    }

    let config = test_config(dir.path(), vec![(AgentKind::Pi, vec![root])]);
    let store = Arc::new(Store::open(&config.db_path).unwrap());
    let engine = Arc::new(SyncEngine::new(
        store,
        Arc::new(SlowFs(OsFs)),
        Arc::new(SystemClock),
        Arc::new(config),
    ));

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.sync_all(CancellationToken::new(), None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.sync_all(CancellationToken::new(), None).await })
    };

    let a = first.await.unwrap().unwrap();
    let b = second.await.unwrap().unwrap();

    // The joiner observed the runner's stats rather than starting a second
    // scan (which would have skipped every file).
    assert_eq!(a, b);
    assert_eq!(a.synced, 30);
    assert_eq!(a.skipped, 0);
}

// S5 plus recovery: deleting the watched source emits no update but
// heartbeats continue; recreating it under a different name with the same
// header id emits an update within a couple of polls.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn watcher_survives_delete_and_recreate() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("pi");
    std::fs::create_dir_all(&root).unwrap();
    let file = root.join("abc.jsonl");
    write_lines(&file, &[pi_header("abc", "/p"), pi_user("hi", 1)]);

    let config = test_config(dir.path(), vec![(AgentKind::Pi, vec![root.clone()])]);
    let (_store, engine) = engine_for(&config);
    engine
        .sync_all(CancellationToken::new(), None)
        .await
        .unwrap();

    let hub = WatcherHub::new(engine.clone(), Arc::new(OsFs), Arc::new(config));
    let cancel = CancellationToken::new();
    let mut ticks = hub.subscribe("abc", cancel.clone());

    // First poll sees the fresh mtime and emits an update
    let tick = tokio::time::timeout(Duration::from_secs(5), ticks.recv())
        .await
        .expect("tick before timeout")
        .expect("channel open");
    assert_eq!(tick, Tick::Updated);

    // Delete the source: no updates, but heartbeats keep coming
    std::fs::remove_file(&file).unwrap();
    let mut saw_heartbeat = false;
    for _ in 0..3 {
        match tokio::time::timeout(Duration::from_secs(5), ticks.recv()).await {
            Ok(Some(Tick::Heartbeat)) => {
                saw_heartbeat = true;
                break;
            }
            Ok(Some(Tick::Updated)) => panic!("update for a deleted file"),
            _ => break,
        }
    }
    assert!(saw_heartbeat);

    // Recreate at a different path; the header id still says "abc"
    write_lines(
        &root.join("renamed.jsonl"),
        &[pi_header("abc", "/p"), pi_user("hi", 1), pi_user("more", 2)],
    );

    let mut saw_update = false;
    for _ in 0..10 {
        match tokio::time::timeout(Duration::from_secs(5), ticks.recv()).await {
            Ok(Some(Tick::Updated)) => {
                saw_update = true;
                break;
            }
            Ok(Some(Tick::Heartbeat)) => continue,
            _ => break,
        }
    }
    assert!(saw_update, "watcher re-resolved the recreated source");

    cancel.cancel();
}

// Resync honors the keep-by-default policy for vanished sources, and purges
// only when configured to.
#[tokio::test]
async fn resync_purge_policy() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("pi");
    std::fs::create_dir_all(&root).unwrap();
    write_lines(&root.join("keep.jsonl"), &[pi_header("keep", "/p"), pi_user("hi", 1)]);
    write_lines(&root.join("gone.jsonl"), &[pi_header("gone", "/p"), pi_user("hi", 1)]);

    let mut config = test_config(dir.path(), vec![(AgentKind::Pi, vec![root.clone()])]);
    let (store, engine) = engine_for(&config);
    engine
        .sync_all(CancellationToken::new(), None)
        .await
        .unwrap();

    std::fs::remove_file(root.join("gone.jsonl")).unwrap();

    // Default: vanished sessions stay
    engine
        .resync_all(CancellationToken::new(), None)
        .await
        .unwrap();
    assert!(store.get_session("gone", Deadline::none()).unwrap().is_some());

    // Opt in to purging
    config.purge_missing = true;
    let (store2, engine2) = {
        let store = Arc::new(Store::open(&config.db_path).unwrap());
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            Arc::new(OsFs),
            Arc::new(SystemClock),
            Arc::new(config.clone()),
        ));
        (store, engine)
    };
    engine2
        .resync_all(CancellationToken::new(), None)
        .await
        .unwrap();
    assert!(store2.get_session("gone", Deadline::none()).unwrap().is_none());
    assert!(store2.get_session("keep", Deadline::none()).unwrap().is_some());
}

// One bad file cannot abort the batch.
#[tokio::test]
async fn bad_file_is_counted_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("pi");
    std::fs::create_dir_all(&root).unwrap();
    write_lines(&root.join("good.jsonl"), &[pi_header("good", "/p"), pi_user("hi", 1)]);
    // Signature matches Pi but the file has a header and zero events
    write_lines(&root.join("empty.jsonl"), &[pi_header("empty", "/p")]);

    let config = test_config(dir.path(), vec![(AgentKind::Pi, vec![root])]);
    let (store, engine) = engine_for(&config);

    let stats = engine
        .sync_all(CancellationToken::new(), None)
        .await
        .unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.synced, 1);
    assert_eq!(stats.errors, 1);
    assert!(store.get_session("good", Deadline::none()).unwrap().is_some());
}

// Parsing is deterministic end to end: re-syncing the same bytes leaves
// identical normalized records.
#[tokio::test]
async fn reparse_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("pi");
    std::fs::create_dir_all(&root).unwrap();
    write_lines(
        &root.join("abc.jsonl"),
        &[
            pi_header("abc", "/home/u/proj"),
            pi_user("list the files", 1),
            pi_assistant_with_tool(2),
            pi_tool_result(3),
        ],
    );

    let config = test_config(dir.path(), vec![(AgentKind::Pi, vec![root])]);
    let (store, engine) = engine_for(&config);
    engine
        .sync_all(CancellationToken::new(), None)
        .await
        .unwrap();
    let before = store
        .get_messages("abc", 0, 100, SortDirection::Asc, Deadline::none())
        .unwrap();

    engine
        .resync_all(CancellationToken::new(), None)
        .await
        .unwrap();
    let after = store
        .get_messages("abc", 0, 100, SortDirection::Asc, Deadline::none())
        .unwrap();

    assert_eq!(before, after);
}
