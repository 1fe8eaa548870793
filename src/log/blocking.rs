//! Blocking bridge for device futures on synchronous call paths.

use std::future::Future;
use std::io;

use tokio::runtime::RuntimeFlavor;

/// Runs device futures to completion from synchronous code.
///
/// Reuses the ambient multi-thread Tokio runtime when there is one (via
/// `block_in_place`), and otherwise owns a small current-thread runtime.
pub(crate) struct IoExecutor {
    runtime: Option<tokio::runtime::Runtime>,
}

impl IoExecutor {
    pub(crate) fn new() -> io::Result<Self> {
        match tokio::runtime::Handle::try_current() {
            Ok(_) => Ok(Self { runtime: None }),
            Err(_) => Ok(Self {
                runtime: Some(tokio::runtime::Builder::new_current_thread().build()?),
            }),
        }
    }

    pub(crate) fn block_on<T>(
        &self,
        fut: impl Future<Output = io::Result<T>>,
    ) -> io::Result<T> {
        if let Some(runtime) = &self.runtime {
            return runtime.block_on(fut);
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => match handle.runtime_flavor() {
                RuntimeFlavor::MultiThread => tokio::task::block_in_place(|| handle.block_on(fut)),
                _ => Err(io::Error::other(
                    "blocking log I/O is not supported on a current-thread Tokio runtime",
                )),
            },
            Err(_) => Err(io::Error::other("tokio runtime went away")),
        }
    }
}
