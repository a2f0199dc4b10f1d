use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub current: u64,
    pub total: u64,
    pub message: String,
}

pub type ProgressSink = dyn Fn(&ProgressEvent) + Send + Sync;

/// Aggregate progress of a run. The total is fixed once, before any step starts;
/// steps then report completed units. Clones share the same counters.
#[derive(Clone, Default)]
pub struct Progress {
    state: Arc<State>,
}

#[derive(Default)]
struct State {
    total: OnceLock<u64>,
    current: AtomicU64,
    sink: Option<Arc<ProgressSink>>,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Arc<ProgressSink>) -> Self {
        Self {
            state: Arc::new(State {
                sink: Some(sink),
                ..State::default()
            }),
        }
    }

    /// Returns false when a total had already been set.
    pub fn set_total(&self, total: u64) -> bool {
        self.state.total.set(total).is_ok()
    }

    pub fn total(&self) -> u64 {
        self.state.total.get().copied().unwrap_or(0)
    }

    pub fn current(&self) -> u64 {
        self.state.current.load(Ordering::SeqCst)
    }

    /// One unit of work is done.
    pub fn report(&self, message: impl Into<String>) {
        let current = self.state.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.emit(current, message.into());
    }

    /// A status message that does not move the progress.
    pub fn log(&self, message: impl Into<String>) {
        self.emit(self.current(), message.into());
    }

    fn emit(&self, current: u64, message: String) {
        info!(current, total = self.total(), "{message}");
        if let Some(sink) = &self.state.sink {
            sink(&ProgressEvent {
                current,
                total: self.total(),
                message,
            });
        }
    }
}
