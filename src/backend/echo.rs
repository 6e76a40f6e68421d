//! Deterministic in-process backend for tests and demos.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{Backend, BackendError, Completion, ErrorKind};

/// What an [`EchoBackend`] does when called.
#[derive(Debug, Clone, PartialEq)]
pub enum EchoMode {
    /// Return the prompt unchanged.
    Echo,
    /// Return a fixed reply.
    Reply(String),
    /// Fail with the given kind.
    Fail(ErrorKind),
    /// Never answer.
    Hang,
}

/// Echo backend with configurable delay and failure mode.
///
/// Counts calls and tracks in-flight calls so tests can assert on
/// single-flight and cancellation behaviour.
#[derive(Debug)]
pub struct EchoBackend {
    name: String,
    delay: Duration,
    mode: EchoMode,
    calls: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
}

impl EchoBackend {
    /// An echo backend with no delay.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay: Duration::ZERO,
            mode: EchoMode::Echo,
            calls: AtomicUsize::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Simulated inference delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the behaviour.
    pub fn with_mode(mut self, mode: EchoMode) -> Self {
        self.mode = mode;
        self
    }

    /// Number of `complete` calls started so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of `complete` calls currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn failure(kind: ErrorKind) -> BackendError {
    match kind {
        ErrorKind::Timeout => BackendError::Timeout,
        ErrorKind::Unavailable => BackendError::Unavailable("echo backend offline".to_string()),
        ErrorKind::QuotaExceeded => BackendError::QuotaExceeded("echo quota".to_string()),
        ErrorKind::InvalidResponse | ErrorKind::QualityRejected => {
            BackendError::InvalidResponse("echo garbage".to_string())
        }
    }
}

#[async_trait]
impl Backend for EchoBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, prompt: &str) -> Result<Completion, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight(Arc::clone(&self.in_flight));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match &self.mode {
            EchoMode::Echo => Ok(Completion::text(prompt)),
            EchoMode::Reply(text) => Ok(Completion::text(text.clone())),
            EchoMode::Fail(kind) => Err(failure(*kind)),
            EchoMode::Hang => {
                std::future::pending::<()>().await;
                Err(BackendError::Timeout)
            }
        }
    }

    async fn health(&self) -> bool {
        !matches!(self.mode, EchoMode::Fail(_) | EchoMode::Hang)
    }
}
