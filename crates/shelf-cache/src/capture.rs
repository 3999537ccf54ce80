//! Record-or-replay capture of output fragments.
//!
//! A [`CaptureStack`] wraps an output sink. Starting a session looks the key
//! up in the [`CacheStore`]: on a hit the stored fragment is replayed when the
//! session ends, on a miss everything written to the stack until the matching
//! end is buffered and then persisted. Sessions nest; output written while a
//! session is capturing lands in the innermost capturing session, otherwise in
//! the sink.
//!
//! A stack belongs to one execution context (one request). It is not meant to
//! be shared between threads.

use crate::codec::{BincodeCodec, Codec};
use crate::error::{CacheError, Result};
use crate::path::CacheKey;
use crate::store::CacheStore;
use std::io::{self, Write};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

/// What to do when captured output cannot be written to the cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CapturePersistPolicy {
    /// Fail the `end` call with [`CacheError::CaptureNotPersisted`].
    #[default]
    Fail,
    /// Log a warning and carry on; the output is still emitted.
    Warn,
}

/// One record-or-replay unit, as returned by [`CaptureStack::end`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureSession {
    key: CacheKey<'static>,
    hit: bool,
    contents: Vec<u8>,
}

impl CaptureSession {
    pub fn key(&self) -> &CacheKey<'static> {
        &self.key
    }

    /// Whether fresh cached content was found when the session started.
    pub fn is_hit(&self) -> bool {
        self.hit
    }

    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    pub fn into_contents(self) -> Vec<u8> {
        self.contents
    }
}

pub struct CaptureStack<W = Vec<u8>, C = BincodeCodec> {
    store: Arc<CacheStore<C>>,
    output: W,
    sessions: Vec<CaptureSession>,
    persist_policy: CapturePersistPolicy,
}

impl<W: Write, C: Codec> CaptureStack<W, C> {
    pub fn new(store: Arc<CacheStore<C>>, output: W) -> Self {
        Self {
            store,
            output,
            sessions: Vec::new(),
            persist_policy: CapturePersistPolicy::default(),
        }
    }

    pub fn with_persist_policy(mut self, policy: CapturePersistPolicy) -> Self {
        self.persist_policy = policy;
        self
    }

    pub fn store(&self) -> &Arc<CacheStore<C>> {
        &self.store
    }

    pub fn output(&self) -> &W {
        &self.output
    }

    pub fn into_output(self) -> W {
        self.output
    }

    /// Number of open sessions.
    pub fn depth(&self) -> usize {
        self.sessions.len()
    }

    /// Whether written output is currently being buffered by some session.
    pub fn is_capturing(&self) -> bool {
        self.sessions.iter().any(|session| !session.hit)
    }

    /// Opens a session for `key`.
    ///
    /// Returns `true` when the caller must produce the output (no fresh entry
    /// was found) and `false` when the cached fragment will be replayed by
    /// [`Self::end`].
    pub fn start<'k>(&mut self, key: impl Into<CacheKey<'k>>, lifetime: Duration) -> bool {
        let key = key.into().into_owned();
        let cached = self.store.get_raw(&key, lifetime);
        let hit = cached.is_some();
        tracing::trace!(
            target = "shelf.cache",
            key = key.name(),
            hit,
            depth = self.sessions.len() + 1,
            "capture session started"
        );
        self.sessions.push(CaptureSession {
            key,
            hit,
            contents: cached.unwrap_or_default(),
        });
        !hit
    }

    /// Closes the innermost session.
    ///
    /// A session that started with a miss has its captured output persisted.
    /// With `echo`, the session's contents (fresh or replayed) are written to
    /// the enclosing capturing session or the sink.
    ///
    /// Ending with no open session is [`CacheError::CaptureStackEmpty`].
    pub fn end(&mut self, echo: bool) -> Result<CaptureSession> {
        let Some(session) = self.sessions.pop() else {
            tracing::error!(
                target = "shelf.cache",
                "capture session ended without a matching start"
            );
            return Err(CacheError::CaptureStackEmpty);
        };

        if !session.hit {
            self.persist(&session)?;
        }
        if echo {
            self.emit(&session.contents)?;
        }
        Ok(session)
    }

    /// Opens a session whose finalization is tied to the returned guard.
    ///
    /// Dropping the guard without [`CaptureScope::finish`] (early return,
    /// `?`, panic in the captured work) pops the session and discards its
    /// partial output, leaving the stack as it was before the call.
    pub fn start_scoped<'k>(
        &mut self,
        key: impl Into<CacheKey<'k>>,
        lifetime: Duration,
    ) -> CaptureScope<'_, W, C> {
        let should_compute = self.start(key, lifetime);
        let depth = self.sessions.len();
        CaptureScope {
            stack: self,
            depth,
            should_compute,
            finished: false,
        }
    }

    /// Runs the full record-or-replay cycle for `key`.
    ///
    /// `produce` is only invoked on a miss and writes its output into the
    /// stack it is handed. An error from `produce` abandons the session
    /// without caching anything.
    pub fn cache_output<'k, E, F>(
        &mut self,
        key: impl Into<CacheKey<'k>>,
        lifetime: Duration,
        echo: bool,
        produce: F,
    ) -> std::result::Result<CaptureSession, E>
    where
        E: From<CacheError>,
        F: FnOnce(&mut CaptureStack<W, C>) -> std::result::Result<(), E>,
    {
        let mut scope = self.start_scoped(key, lifetime);
        if scope.should_compute() {
            produce(&mut *scope)?;
        }
        Ok(scope.finish(echo)?)
    }

    fn persist(&self, session: &CaptureSession) -> Result<()> {
        if !self.store.is_active() {
            // Disabled cache: nothing to persist, and nothing went wrong.
            return Ok(());
        }
        if self.store.store_raw(&session.key, &session.contents)? {
            return Ok(());
        }
        match self.persist_policy {
            CapturePersistPolicy::Fail => Err(CacheError::CaptureNotPersisted {
                key: session.key.name().to_string(),
            }),
            CapturePersistPolicy::Warn => {
                tracing::warn!(
                    target = "shelf.cache",
                    key = session.key.name(),
                    "captured output could not be persisted"
                );
                Ok(())
            }
        }
    }

    fn emit(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.sessions.iter_mut().rev().find(|session| !session.hit) {
            Some(session) => {
                session.contents.extend_from_slice(bytes);
                Ok(())
            }
            None => self.output.write_all(bytes),
        }
    }

    fn discard_from(&mut self, depth: usize) {
        let discarded = self.sessions.len().saturating_sub(depth.saturating_sub(1));
        if discarded > 0 {
            tracing::debug!(
                target = "shelf.cache",
                discarded,
                "capture scope dropped before finishing; discarding partial output"
            );
        }
        self.sessions.truncate(depth.saturating_sub(1));
    }
}

impl<W: Write, C: Codec> Write for CaptureStack<W, C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.emit(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.output.flush()
    }
}

/// Guard returned by [`CaptureStack::start_scoped`].
///
/// Derefs to the stack, so output can be written through it and further
/// sessions nested inside it.
pub struct CaptureScope<'s, W: Write, C: Codec> {
    stack: &'s mut CaptureStack<W, C>,
    depth: usize,
    should_compute: bool,
    finished: bool,
}

impl<W: Write, C: Codec> CaptureScope<'_, W, C> {
    pub fn should_compute(&self) -> bool {
        self.should_compute
    }

    /// Ends this scope's session, see [`CaptureStack::end`].
    ///
    /// Sessions opened inside the scope and never ended are discarded first.
    pub fn finish(mut self, echo: bool) -> Result<CaptureSession> {
        self.finished = true;
        if self.stack.sessions.len() < self.depth {
            // Someone already ended this scope's session through the stack.
            return Err(CacheError::CaptureStackEmpty);
        }
        if self.stack.sessions.len() > self.depth {
            tracing::debug!(
                target = "shelf.cache",
                unfinished = self.stack.sessions.len() - self.depth,
                "discarding nested capture sessions left open"
            );
            self.stack.sessions.truncate(self.depth);
        }
        self.stack.end(echo)
    }
}

impl<W: Write, C: Codec> Deref for CaptureScope<'_, W, C> {
    type Target = CaptureStack<W, C>;

    fn deref(&self) -> &Self::Target {
        self.stack
    }
}

impl<W: Write, C: Codec> DerefMut for CaptureScope<'_, W, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.stack
    }
}

impl<W: Write, C: Codec> Write for CaptureScope<'_, W, C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stack.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stack.flush()
    }
}

impl<W: Write, C: Codec> Drop for CaptureScope<'_, W, C> {
    fn drop(&mut self) {
        if !self.finished {
            self.stack.discard_from(self.depth);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CacheStoreConfig;

    const HOUR: Duration = Duration::from_secs(3600);

    fn new_stack() -> (tempfile::TempDir, CaptureStack) {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::open(CacheStoreConfig::new(tmp.path())).unwrap();
        (tmp, CaptureStack::new(Arc::new(store), Vec::new()))
    }

    #[test]
    fn output_outside_sessions_goes_to_sink() {
        let (_tmp, mut stack) = new_stack();
        write!(stack, "plain").unwrap();
        assert_eq!(stack.output(), b"plain");
        assert!(!stack.is_capturing());
    }

    #[test]
    fn end_on_empty_stack_is_an_error() {
        let (_tmp, mut stack) = new_stack();
        let err = stack.end(true).unwrap_err();
        assert!(err.is_programming_error());
    }

    #[test]
    fn dropped_scope_restores_stack() {
        let (tmp, mut stack) = new_stack();
        {
            let mut scope = stack.start_scoped("widget", HOUR);
            assert!(scope.should_compute());
            write!(scope, "half-done").unwrap();
            scope.start("inner", HOUR);
        }
        assert_eq!(stack.depth(), 0);
        assert!(stack.output().is_empty());
        assert!(!tmp.path().join("widget").exists());
    }

    #[test]
    fn finish_discards_unfinished_nested_sessions() {
        let (tmp, mut stack) = new_stack();
        let mut scope = stack.start_scoped("outer", HOUR);
        write!(scope, "outer;").unwrap();
        scope.start("forgotten", HOUR);
        write!(scope, "lost;").unwrap();
        let session = scope.finish(false).unwrap();

        assert_eq!(session.contents(), b"outer;");
        assert_eq!(stack.depth(), 0);
        assert!(!tmp.path().join("forgotten").exists());
    }

    #[test]
    fn finish_after_manual_end_is_an_error() {
        let (_tmp, mut stack) = new_stack();
        let mut scope = stack.start_scoped("k", HOUR);
        scope.end(false).unwrap();
        assert!(matches!(
            scope.finish(false),
            Err(CacheError::CaptureStackEmpty)
        ));
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn replayed_output_of_a_hit_does_not_enter_hit_parent() {
        let (_tmp, mut stack) = new_stack();
        stack.store().store_raw("parent", b"P").unwrap();

        assert!(!stack.start("parent", HOUR));
        // Work inside a replayed parent is unusual but must not corrupt it.
        assert!(stack.start("child", HOUR));
        write!(stack, "c").unwrap();
        stack.end(true).unwrap();
        let parent = stack.end(true).unwrap();

        assert_eq!(parent.contents(), b"P");
        assert_eq!(stack.output(), b"cP");
    }
}
