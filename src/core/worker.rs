//! Background extraction worker.
//!
//! A single long-lived thread executes submitted batches in submission
//! order and reports through a channel. Cancellation is polled between
//! tasks; a task in flight always runs to completion.

use crate::config::CoreConfig;
use crate::core::extraction::{run_task, TaskResult};
use crate::core::planner::ExtractionTask;
use crate::io::crs::CrsTransformer;
use crate::io::raster::RasterOpener;
use crate::types::{ProfileError, ProfileResult, RequestId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Events published by the worker
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Progress { request: RequestId, done: usize, total: usize },
    Result(Box<TaskResult>),
    Finished(RequestId),
    Cancelled(RequestId),
}

impl WorkerEvent {
    pub fn request(&self) -> RequestId {
        match self {
            WorkerEvent::Progress { request, .. } => *request,
            WorkerEvent::Result(result) => result.request,
            WorkerEvent::Finished(request) | WorkerEvent::Cancelled(request) => *request,
        }
    }

    /// True for the last event of a batch
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerEvent::Finished(_) | WorkerEvent::Cancelled(_))
    }
}

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Batch {
    request: RequestId,
    tasks: Vec<ExtractionTask>,
    token: CancelToken,
}

/// Raster access shared by every task of a worker
#[derive(Clone)]
pub struct ExtractionContext {
    pub opener: Arc<dyn RasterOpener>,
    pub transformer: Arc<dyn CrsTransformer>,
    pub parallelism: usize,
}

/// Execute a batch on the calling thread, reporting through `emit`.
///
/// `emit` returns `false` when nobody listens any more, which ends the
/// batch early without a terminal event.
pub fn run_batch<F>(
    request: RequestId,
    tasks: &[ExtractionTask],
    token: &CancelToken,
    context: &ExtractionContext,
    mut emit: F,
) where
    F: FnMut(WorkerEvent) -> bool,
{
    let total = tasks.len();
    let chunk_size = context.parallelism.max(1);
    log::info!("Request {}: extracting {} tasks", request, total);

    let mut done = 0;
    for chunk in tasks.chunks(chunk_size) {
        if token.is_cancelled() {
            log::info!("Request {} cancelled after {}/{} tasks", request, done, total);
            emit(WorkerEvent::Cancelled(request));
            return;
        }
        for result in run_chunk(request, chunk, context) {
            done += 1;
            if !emit(WorkerEvent::Result(Box::new(result))) {
                return;
            }
            if !emit(WorkerEvent::Progress { request, done, total }) {
                return;
            }
        }
    }
    log::info!("Request {} finished ({} tasks)", request, total);
    emit(WorkerEvent::Finished(request));
}

#[cfg(feature = "parallel")]
fn run_chunk(request: RequestId, chunk: &[ExtractionTask], context: &ExtractionContext) -> Vec<TaskResult> {
    use rayon::prelude::*;

    if chunk.len() == 1 {
        return vec![run_task(&chunk[0], request, context.opener.as_ref(), context.transformer.as_ref())];
    }
    // collect() on an indexed parallel iterator keeps task order
    chunk
        .par_iter()
        .map(|task| run_task(task, request, context.opener.as_ref(), context.transformer.as_ref()))
        .collect()
}

#[cfg(not(feature = "parallel"))]
fn run_chunk(request: RequestId, chunk: &[ExtractionTask], context: &ExtractionContext) -> Vec<TaskResult> {
    chunk
        .iter()
        .map(|task| run_task(task, request, context.opener.as_ref(), context.transformer.as_ref()))
        .collect()
}

/// Handle to the background extraction thread
pub struct ExtractionWorker {
    jobs: Option<Sender<Batch>>,
    tokens: Arc<Mutex<HashMap<RequestId, CancelToken>>>,
    thread: Option<JoinHandle<()>>,
}

impl ExtractionWorker {
    /// Start the worker thread; events arrive on the returned receiver.
    pub fn spawn(
        config: &CoreConfig,
        opener: Arc<dyn RasterOpener>,
        transformer: Arc<dyn CrsTransformer>,
    ) -> ProfileResult<(Self, Receiver<WorkerEvent>)> {
        config.validate()?;
        let (job_tx, job_rx) = mpsc::channel::<Batch>();
        let (event_tx, event_rx) = mpsc::channel::<WorkerEvent>();
        let tokens: Arc<Mutex<HashMap<RequestId, CancelToken>>> = Arc::new(Mutex::new(HashMap::new()));
        let context = ExtractionContext {
            opener,
            transformer,
            parallelism: config.parallelism,
        };

        let thread_tokens = Arc::clone(&tokens);
        let thread = std::thread::Builder::new()
            .name("profile-extraction".to_string())
            .spawn(move || {
                while let Ok(batch) = job_rx.recv() {
                    run_batch(batch.request, &batch.tasks, &batch.token, &context, |event| {
                        event_tx.send(event).is_ok()
                    });
                    if let Ok(mut tokens) = thread_tokens.lock() {
                        tokens.remove(&batch.request);
                    }
                }
                log::debug!("Extraction worker stopped");
            })?;

        Ok((
            Self {
                jobs: Some(job_tx),
                tokens,
                thread: Some(thread),
            },
            event_rx,
        ))
    }

    /// Queue a batch. Batches run one after another in submission order.
    pub fn submit(&self, request: RequestId, tasks: Vec<ExtractionTask>) -> ProfileResult<()> {
        let token = CancelToken::new();
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(request, token.clone());
        }
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| ProfileError::InvalidInput("extraction worker is shut down".to_string()))?;
        jobs.send(Batch { request, tasks, token })
            .map_err(|_| ProfileError::InvalidInput("extraction worker is not running".to_string()))
    }

    /// Best-effort cancellation; returns false if the batch is unknown
    /// or already complete.
    pub fn cancel(&self, request: RequestId) -> bool {
        match self.tokens.lock() {
            Ok(tokens) => match tokens.get(&request) {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Requests that are queued or running
    pub fn pending(&self) -> Vec<RequestId> {
        let mut pending: Vec<_> = self
            .tokens
            .lock()
            .map(|t| t.keys().copied().collect())
            .unwrap_or_default();
        pending.sort();
        pending
    }
}

impl Drop for ExtractionWorker {
    fn drop(&mut self) {
        if let Ok(tokens) = self.tokens.lock() {
            tokens.values().for_each(CancelToken::cancel);
        }
        // closing the job channel ends the worker loop
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::crs::BuiltinTransformer;
    use crate::io::raster::{MemoryRaster, MemoryRasterCatalog};
    use crate::types::{Crs, GeoTransform, Geometry, ProfileId};
    use chrono::NaiveDate;

    fn context(catalog: MemoryRasterCatalog, parallelism: usize) -> ExtractionContext {
        ExtractionContext {
            opener: Arc::new(catalog),
            transformer: Arc::new(BuiltinTransformer),
            parallelism,
        }
    }

    fn tasks(n: usize) -> (MemoryRasterCatalog, Vec<ExtractionTask>) {
        let catalog = MemoryRasterCatalog::new();
        let crs = Crs::epsg(32633);
        let mut tasks = Vec::new();
        for i in 0..n {
            let uri = format!("mem://{:03}", i);
            catalog.insert(MemoryRaster::filled(
                uri.clone(),
                &[i as f64],
                (2, 2),
                GeoTransform::north_up(0.0, 2.0, 1.0, 1.0),
                crs.clone(),
            ));
            tasks.push(ExtractionTask {
                uri,
                date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap() + chrono::Duration::days(i as i64),
                geometries: vec![Geometry::point(0.5, 1.5, crs.clone())],
                bands: vec![0],
                profile_ids: vec![ProfileId(1)],
            });
        }
        (catalog, tasks)
    }

    #[test]
    fn test_run_batch_emits_in_order() {
        let (catalog, tasks) = tasks(5);
        let ctx = context(catalog, 3);
        let mut events = Vec::new();
        run_batch(RequestId(7), &tasks, &CancelToken::new(), &ctx, |e| {
            events.push(e);
            true
        });
        let uris: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Result(r) => Some(r.task.uri.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(uris, tasks.iter().map(|t| t.uri.clone()).collect::<Vec<_>>());
        let progress: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Progress { done, total, .. } => Some((*done, *total)),
                _ => None,
            })
            .collect();
        assert_eq!(progress.last(), Some(&(5, 5)));
        assert!(matches!(events.last(), Some(WorkerEvent::Finished(RequestId(7)))));
    }

    #[test]
    fn test_cancel_between_tasks() {
        let (catalog, tasks) = tasks(10);
        let ctx = context(catalog, 1);
        let token = CancelToken::new();
        let mut results = 0;
        let mut last = None;
        run_batch(RequestId(1), &tasks, &token, &ctx, |e| {
            if let WorkerEvent::Progress { done: 3, .. } = e {
                token.cancel();
            }
            if matches!(e, WorkerEvent::Result(_)) {
                results += 1;
            }
            last = Some(e);
            true
        });
        assert_eq!(results, 3);
        assert!(matches!(last, Some(WorkerEvent::Cancelled(RequestId(1)))));
    }

    #[test]
    fn test_failed_task_does_not_stop_batch() {
        let (catalog, mut tasks) = tasks(3);
        tasks[1].uri = "mem://missing".to_string();
        let ctx = context(catalog, 1);
        let mut failed = 0;
        let mut finished = false;
        run_batch(RequestId(2), &tasks, &CancelToken::new(), &ctx, |e| {
            match e {
                WorkerEvent::Result(r) if r.is_failed() => failed += 1,
                WorkerEvent::Finished(_) => finished = true,
                _ => {}
            }
            true
        });
        assert_eq!(failed, 1);
        assert!(finished);
    }

    #[test]
    fn test_worker_thread_round_trip() {
        let (catalog, tasks) = tasks(4);
        let (worker, events) = ExtractionWorker::spawn(
            &CoreConfig::default(),
            Arc::new(catalog),
            Arc::new(BuiltinTransformer),
        )
        .unwrap();
        worker.submit(RequestId(1), tasks).unwrap();
        let mut results = 0;
        for event in events.iter() {
            if let WorkerEvent::Result(_) = event {
                results += 1;
            }
            if event.is_terminal() {
                assert!(matches!(event, WorkerEvent::Finished(RequestId(1))));
                break;
            }
        }
        assert_eq!(results, 4);
        assert!(!worker.cancel(RequestId(99)));
    }
}
