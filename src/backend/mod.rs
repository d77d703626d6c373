// src/backend/mod.rs

//! Remote task service abstraction.
//!
//! The engine talks to a `TaskBackend` instead of a concrete service client.
//! This keeps trigger/collect bookkeeping testable without a fleet:
//!
//! - [`LocalBackend`] runs shard requests as local processes.
//! - Tests provide their own backend that serves scripted shard records.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use crate::collect::ShardRecord;
use crate::dispatch::{ShardHandle, ShardRequest};
use crate::errors::Result;
use crate::types::TaskState;

pub mod local;

pub use local::{LocalBackend, LocalBackendConfig};

/// Boxed future returned by backend and merge-stage methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait abstracting the remote task service.
pub trait TaskBackend: Send + Sync {
    /// Submit one shard and return its handle.
    fn submit(&self, request: ShardRequest) -> BoxFuture<'_, Result<ShardHandle>>;

    /// Submit several shards in a single call.
    ///
    /// The default submits one by one and stops at the first error.
    fn submit_all(&self, requests: Vec<ShardRequest>) -> BoxFuture<'_, Result<Vec<ShardHandle>>> {
        Box::pin(async move {
            let mut handles = Vec::with_capacity(requests.len());
            for request in requests {
                handles.push(self.submit(request).await?);
            }
            Ok(handles)
        })
    }

    /// Current state of each task; `None` for ids the service doesn't know.
    fn poll_states(&self, task_ids: Vec<String>) -> BoxFuture<'_, Result<Vec<Option<TaskState>>>>;

    /// Result record of each task, in the order given.
    ///
    /// Shard outputs are downloaded to `<output_dir>/<task_id>/`. A task that
    /// produced nothing yields `None`.
    fn fetch_results(
        &self,
        task_ids: Vec<String>,
        output_dir: PathBuf,
    ) -> BoxFuture<'_, Result<Vec<Option<ShardRecord>>>>;
}
