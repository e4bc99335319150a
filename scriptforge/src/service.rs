//! Submit/poll boundary over a shared [`Pipeline`].
//!
//! Each submission runs on its own worker thread; callers poll the request
//! store for progress. The service owns no per-request state beyond the
//! worker handles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use tracing::{info, warn};

use crate::core::state::{PipelineState, RequestSnapshot};
use crate::core::types::DesignRequest;
use crate::error::ConfigError;
use crate::io::store::RequestStore;
use crate::pipeline::Pipeline;

pub struct DesignService {
    pipeline: Arc<Pipeline>,
    store: Arc<dyn RequestStore>,
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl DesignService {
    /// Attach `store` to `pipeline` and serve requests from it.
    pub fn new(pipeline: Pipeline, store: Arc<dyn RequestStore>) -> Self {
        Self {
            pipeline: Arc::new(pipeline.with_store(store.clone())),
            store,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a design run and return its request id immediately.
    ///
    /// A pending snapshot is stored before the worker starts, so the id is
    /// pollable as soon as this returns.
    pub fn submit(&self, prompt: &str, max_iterations: Option<u32>) -> Result<String> {
        let max_iterations = max_iterations.unwrap_or(self.pipeline.default_max_iterations());
        if max_iterations == 0 {
            return Err(ConfigError::ZeroIterations.into());
        }
        let request = DesignRequest::new(prompt)?;
        let request_id = request.id().to_string();
        self.store
            .put(PipelineState::new(request.clone(), max_iterations).snapshot())
            .context("store pending request")?;

        let pipeline = self.pipeline.clone();
        let handle = thread::Builder::new()
            .name(format!("design-{}", &request_id[..8.min(request_id.len())]))
            .spawn(move || {
                pipeline.run(request, max_iterations);
            })
            .context("spawn design worker")?;
        let mut workers = self
            .workers
            .lock()
            .map_err(|_| anyhow!("worker registry lock poisoned"))?;
        workers.retain(|_, worker| !worker.is_finished());
        workers.insert(request_id.clone(), handle);
        drop(workers);
        info!(request_id = %request_id, max_iterations, "design submitted");
        Ok(request_id)
    }

    /// Latest snapshot for `request_id`, or `None` if it was never submitted.
    pub fn poll(&self, request_id: &str) -> Result<Option<RequestSnapshot>> {
        self.store.get(request_id)
    }

    /// Block until the run for `request_id` has finished, then return its
    /// final snapshot.
    pub fn wait(&self, request_id: &str) -> Result<Option<RequestSnapshot>> {
        let handle = self
            .workers
            .lock()
            .map_err(|_| anyhow!("worker registry lock poisoned"))?
            .remove(request_id);
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!(request_id, "design worker panicked");
        }
        self.poll(request_id)
    }

    /// Worker handles still held; finished ones are dropped on the next submit.
    pub fn tracked_workers(&self) -> usize {
        self.workers.lock().map(|workers| workers.len()).unwrap_or(0)
    }

    /// Join every outstanding worker.
    pub fn wait_all(&self) -> Result<()> {
        let handles: Vec<(String, JoinHandle<()>)> = self
            .workers
            .lock()
            .map_err(|_| anyhow!("worker registry lock poisoned"))?
            .drain()
            .collect();
        for (request_id, handle) in handles {
            if handle.join().is_err() {
                warn!(request_id = %request_id, "design worker panicked");
            }
        }
        Ok(())
    }
}
