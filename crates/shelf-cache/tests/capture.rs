use shelf_cache::{CacheError, CacheStore, CacheStoreConfig, CapturePersistPolicy, CaptureStack};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const HOUR: Duration = Duration::from_secs(3600);

fn new_store(tmp: &TempDir) -> Arc<CacheStore> {
    Arc::new(CacheStore::open(CacheStoreConfig::new(tmp.path()).key_prefix("frag_")).unwrap())
}

fn render_sidebar(out: &mut impl Write, renders: &mut u32) -> std::io::Result<()> {
    *renders += 1;
    write!(out, "<aside>{} items</aside>", 3)
}

#[test]
fn miss_computes_and_persists_then_hit_replays() {
    let tmp = TempDir::new().unwrap();
    let store = new_store(&tmp);
    let mut renders = 0;

    let mut stack = CaptureStack::new(Arc::clone(&store), Vec::new());
    assert!(stack.start("sidebar", HOUR));
    render_sidebar(&mut stack, &mut renders).unwrap();
    let session = stack.end(true).unwrap();
    assert!(!session.is_hit());
    assert_eq!(session.contents(), b"<aside>3 items</aside>");
    assert_eq!(stack.into_output(), b"<aside>3 items</aside>");

    let path = store.file_path("sidebar");
    let written_at = std::fs::metadata(&path).unwrap().modified().unwrap();
    assert_eq!(store.get_raw("sidebar", HOUR).unwrap(), b"<aside>3 items</aside>");

    let mut stack = CaptureStack::new(Arc::clone(&store), Vec::new());
    if stack.start("sidebar", HOUR) {
        render_sidebar(&mut stack, &mut renders).unwrap();
    }
    let session = stack.end(true).unwrap();
    assert!(session.is_hit());
    assert_eq!(stack.into_output(), b"<aside>3 items</aside>");
    assert_eq!(renders, 1);
    assert_eq!(
        std::fs::metadata(&path).unwrap().modified().unwrap(),
        written_at,
        "a replayed session must not rewrite the cache file"
    );
}

#[test]
fn end_without_echo_keeps_output_out_of_the_sink() {
    let tmp = TempDir::new().unwrap();
    let mut stack = CaptureStack::new(new_store(&tmp), Vec::new());

    stack.start("quiet", HOUR);
    write!(stack, "captured").unwrap();
    let session = stack.end(false).unwrap();

    assert_eq!(session.into_contents(), b"captured");
    assert!(stack.output().is_empty());
}

#[test]
fn nested_sessions_are_lifo_and_inner_output_joins_outer() {
    let tmp = TempDir::new().unwrap();
    let store = new_store(&tmp);
    let mut stack = CaptureStack::new(Arc::clone(&store), Vec::new());

    assert!(stack.start("page", HOUR));
    write!(stack, "<main>").unwrap();
    assert!(stack.start("menu", HOUR));
    write!(stack, "<nav/>").unwrap();
    assert_eq!(stack.depth(), 2);
    let inner = stack.end(true).unwrap();
    write!(stack, "</main>").unwrap();
    let outer = stack.end(true).unwrap();

    assert_eq!(inner.key().name(), "menu");
    assert_eq!(inner.contents(), b"<nav/>");
    assert_eq!(outer.key().name(), "page");
    assert_eq!(outer.contents(), b"<main><nav/></main>");
    assert_eq!(stack.output(), b"<main><nav/></main>");
    assert_eq!(store.get_raw("menu", HOUR).unwrap(), b"<nav/>");
    assert_eq!(store.get_raw("page", HOUR).unwrap(), b"<main><nav/></main>");
}

#[test]
fn ending_an_empty_stack_fails_loudly() {
    let tmp = TempDir::new().unwrap();
    let mut stack = CaptureStack::new(new_store(&tmp), Vec::new());

    let err = stack.end(true).unwrap_err();
    assert!(matches!(err, CacheError::CaptureStackEmpty));
    assert!(err.is_programming_error());

    stack.start("once", HOUR);
    stack.end(false).unwrap();
    assert!(matches!(stack.end(false), Err(CacheError::CaptureStackEmpty)));
}

#[test]
fn cache_output_runs_producer_only_on_miss() {
    let tmp = TempDir::new().unwrap();
    let store = new_store(&tmp);
    let mut renders = 0;

    for _ in 0..3 {
        let mut stack = CaptureStack::new(Arc::clone(&store), Vec::new());
        let session = stack
            .cache_output("footer", HOUR, true, |out| {
                render_sidebar(out, &mut renders).map_err(CacheError::from)
            })
            .unwrap();
        assert_eq!(session.contents(), b"<aside>3 items</aside>");
        assert_eq!(stack.output(), b"<aside>3 items</aside>");
    }
    assert_eq!(renders, 1);
}

#[derive(Debug)]
#[allow(dead_code)]
enum RenderError {
    Template,
    Cache(CacheError),
}

impl From<CacheError> for RenderError {
    fn from(err: CacheError) -> Self {
        RenderError::Cache(err)
    }
}

#[test]
fn failing_producer_leaves_stack_and_disk_clean() {
    let tmp = TempDir::new().unwrap();
    let store = new_store(&tmp);
    let mut stack = CaptureStack::new(Arc::clone(&store), Vec::new());

    assert!(stack.start("outer", HOUR));
    let result: Result<_, RenderError> = stack.cache_output("broken", HOUR, true, |out| {
        write!(out, "partial").map_err(|err| RenderError::Cache(err.into()))?;
        Err(RenderError::Template)
    });
    assert!(matches!(result, Err(RenderError::Template)));
    assert_eq!(stack.depth(), 1);
    assert!(!store.file_path("broken").exists());

    // The outer session is intact and did not receive the partial output.
    write!(stack, "outer").unwrap();
    let outer = stack.end(false).unwrap();
    assert_eq!(outer.contents(), b"outer");
}

#[test]
fn panicking_producer_does_not_corrupt_the_stack() {
    let tmp = TempDir::new().unwrap();
    let store = new_store(&tmp);
    let mut stack = CaptureStack::new(Arc::clone(&store), Vec::new());

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let mut scope = stack.start_scoped("explodes", HOUR);
        write!(scope, "partial").unwrap();
        panic!("template blew up");
    }));
    assert!(outcome.is_err());
    assert_eq!(stack.depth(), 0);
    assert!(!store.file_path("explodes").exists());

    assert!(stack.start("explodes", HOUR));
    write!(stack, "ok").unwrap();
    stack.end(true).unwrap();
    assert_eq!(stack.output(), b"ok");
}

#[test]
fn disabled_store_always_computes_and_never_fails() {
    let tmp = TempDir::new().unwrap();
    let store = new_store(&tmp);
    store.store_raw("fragment", b"stale").unwrap();
    store.set_enabled(false);

    let mut stack = CaptureStack::new(Arc::clone(&store), Vec::new());
    assert!(stack.start("fragment", HOUR));
    write!(stack, "fresh").unwrap();
    let session = stack.end(true).unwrap();

    assert!(!session.is_hit());
    assert_eq!(stack.output(), b"fresh");
    store.set_enabled(true);
    assert_eq!(store.get_raw("fragment", HOUR).unwrap(), b"stale");
}

/// Puts a directory where the entry file should be, so every write fails.
fn poison_entry(store: &CacheStore, key: &str) {
    std::fs::create_dir(store.file_path(key)).unwrap();
}

#[test]
fn persistence_failure_inside_a_session_is_fatal_by_default() {
    let tmp = TempDir::new().unwrap();
    let store = new_store(&tmp);
    poison_entry(&store, "blocked");

    let mut stack = CaptureStack::new(Arc::clone(&store), Vec::new());
    assert!(stack.start("blocked", HOUR));
    write!(stack, "content").unwrap();
    let err = stack.end(true).unwrap_err();

    match err {
        CacheError::CaptureNotPersisted { key } => assert_eq!(key, "blocked"),
        other => panic!("expected CaptureNotPersisted, got {other:?}"),
    }
    assert_eq!(stack.depth(), 0);
}

#[test]
fn lenient_policy_warns_and_still_echoes() {
    let tmp = TempDir::new().unwrap();
    let store = new_store(&tmp);
    poison_entry(&store, "blocked");

    let mut stack = CaptureStack::new(Arc::clone(&store), Vec::new())
        .with_persist_policy(CapturePersistPolicy::Warn);
    assert!(stack.start("blocked", HOUR));
    write!(stack, "content").unwrap();
    let session = stack.end(true).unwrap();

    assert_eq!(session.contents(), b"content");
    assert_eq!(stack.output(), b"content");
}
