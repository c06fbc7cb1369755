//! Run-to-completion bridge between blocking callers and async driver code.
//!
//! A [`Bridge`] owns a tokio runtime and drives futures on it from synchronous
//! code. The strategy is fixed at construction by [`BridgeMode`]:
//!
//! - [`BridgeMode::Foreground`] drives a current-thread runtime on the calling
//!   thread. The caller must not already be inside a runtime.
//! - [`BridgeMode::Fallback`] spawns the future onto a dedicated background
//!   runtime thread and blocks the caller on a channel until it completes.
//!   This works from any thread, including one that runs a runtime.

use std::future::Future;
use std::sync::mpsc;

use tokio::runtime::{Builder, Handle, Runtime};

use crate::error::{Error, Result};

const FALLBACK_THREAD_NAME: &str = "pgbridge-fallback";

/// How a [`Bridge`] runs futures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BridgeMode {
    /// Block on a bridge-owned runtime in the calling thread.
    #[default]
    Foreground,
    /// Marshal onto a background runtime thread.
    Fallback,
}

impl BridgeMode {
    /// Mode selected by the `async_fallback` connect argument.
    #[must_use]
    pub const fn from_async_fallback(async_fallback: bool) -> Self {
        if async_fallback {
            Self::Fallback
        } else {
            Self::Foreground
        }
    }
}

/// Runs futures to completion from synchronous code.
#[derive(Debug)]
pub struct Bridge {
    mode: BridgeMode,
    runtime: Option<Runtime>,
}

impl Bridge {
    /// Start a bridge with its own runtime.
    pub fn new(mode: BridgeMode) -> Result<Self> {
        let runtime = match mode {
            BridgeMode::Foreground => Builder::new_current_thread().enable_all().build(),
            BridgeMode::Fallback => Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name(FALLBACK_THREAD_NAME)
                .enable_all()
                .build(),
        }
        .map_err(|e| Error::interface(format!("failed to start event loop: {e}")))?;

        tracing::debug!(?mode, "bridge runtime started");
        Ok(Self {
            mode,
            runtime: Some(runtime),
        })
    }

    /// Strategy this bridge was built with.
    #[must_use]
    pub const fn mode(&self) -> BridgeMode {
        self.mode
    }

    /// Run `future` to completion and return its output.
    ///
    /// Errors produced by the future are returned unchanged.
    pub fn run<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let Some(runtime) = self.runtime.as_ref() else {
            return Err(Error::interface("event loop has been shut down"));
        };

        match self.mode {
            BridgeMode::Foreground => {
                if Handle::try_current().is_ok() {
                    return Err(Error::interface(
                        "blocking call issued from inside a running event loop; \
                         connect with async_fallback=true to run it on a background loop",
                    ));
                }
                runtime.block_on(future)
            }
            BridgeMode::Fallback => {
                let (tx, rx) = mpsc::sync_channel(1);
                runtime.spawn(async move {
                    // The receiver only disappears if the caller is gone.
                    let _ = tx.send(future.await);
                });
                rx.recv().map_err(|_| {
                    Error::internal("background event loop dropped the operation before completion")
                })?
            }
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
