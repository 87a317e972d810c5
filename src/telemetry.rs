//! Logging handle passed explicitly to every component that spawns work.
//!
//! Nothing here installs a process-global subscriber. Threads enter the
//! dispatch with [`Telemetry::enter`] and futures carry it through
//! [`Telemetry::instrument`].

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::dispatcher::DefaultGuard;
use tracing::instrument::{WithDispatch, WithSubscriber};
use tracing::Dispatch;
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
pub struct Telemetry {
    dispatch: Dispatch,
}

impl Telemetry {
    /// Compact fmt output. `RUST_LOG` wins over `level` when set.
    pub fn new(level: &str) -> Self {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_target(true)
            .finish();
        Self {
            dispatch: Dispatch::new(subscriber),
        }
    }

    /// Discards everything.
    pub fn disabled() -> Self {
        Self {
            dispatch: Dispatch::none(),
        }
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Makes this the default on the current thread until the guard drops.
    pub fn enter(&self) -> DefaultGuard {
        tracing::dispatcher::set_default(&self.dispatch)
    }

    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }

    pub fn instrument<F: Future>(&self, fut: F) -> WithDispatch<F> {
        fut.with_subscriber(self.dispatch.clone())
    }

    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(self.instrument(fut))
    }
}

fn default_directives(level: &str) -> String {
    format!("{},webrtc=error", level)
}
