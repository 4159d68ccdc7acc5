// src/workers/pool.rs
//
// Worker pool: request routing, timeouts and self-healing.

use std::collections::HashMap;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{error, info, warn};

use super::processor::{self, WorkerOutput};
use super::{
    ExtractedChunk, PoolEvent, ProcessedChunk, WorkerCommand, WorkerError, WorkerInfo, WorkerPoolConfig,
    WorkerPoolStats, WorkerReply, WorkerRequest, WorkerResponse, WorkerState, WORKER_QUEUE_DEPTH,
};
use crate::framing::{ExtractorStats, FrameDetectionConfig};

const EVENT_CAPACITY: usize = 64;

/// Room for configure/reset/stats messages queued behind a data request
const CONTROL_QUEUE_DEPTH: usize = 4;

type ReplySender = oneshot::Sender<Result<WorkerReply, WorkerError>>;

struct Pending {
    started: Instant,
    reply: ReplySender,
}

struct WorkerSlot {
    id: usize,
    /// Bumped on every respawn so a dead worker's router cannot touch its
    /// replacement
    generation: u64,
    state: WorkerState,
    requests: std_mpsc::SyncSender<WorkerRequest>,
    pending: HashMap<String, Pending>,
    completed: u64,
    router: tokio::task::JoinHandle<()>,
    _thread: JoinHandle<()>,
}

impl WorkerSlot {
    /// Queue a configuration nobody waits on. The worker stays Busy until it
    /// has applied it, so selection prefers already-configured workers.
    fn queue_configure(
        &mut self,
        id: String,
        config: FrameDetectionConfig,
    ) -> Result<(), std_mpsc::TrySendError<WorkerRequest>> {
        self.requests.try_send(WorkerRequest {
            id: id.clone(),
            command: WorkerCommand::Configure(config),
        })?;
        let (tx, _) = oneshot::channel();
        self.pending.insert(
            id,
            Pending {
                started: Instant::now(),
                reply: tx,
            },
        );
        self.state = WorkerState::Busy;
        Ok(())
    }
}

#[derive(Default)]
struct Counters {
    completed: u64,
    failed: u64,
    timeouts: u64,
    respawns: u64,
    total_response: Duration,
}

struct PoolInner {
    workers: Vec<WorkerSlot>,
    next_request: u64,
    round_robin: usize,
    destroyed: bool,
    /// Re-sent to replacement workers
    last_config: Option<FrameDetectionConfig>,
    counters: Counters,
}

impl PoolInner {
    fn next_request_id(&mut self) -> String {
        self.next_request += 1;
        format!("req_{}", self.next_request)
    }

    fn slot_index(&self, worker: usize, generation: u64) -> Option<usize> {
        self.workers
            .iter()
            .position(|w| w.id == worker && w.generation == generation)
    }

    /// First idle worker. When none is idle the round-robin pick is busy,
    /// and the request fails fast rather than queueing behind it.
    fn select(&mut self) -> Result<usize, WorkerError> {
        if let Some(idx) = self
            .workers
            .iter()
            .position(|w| w.state == WorkerState::Idle)
        {
            return Ok(idx);
        }
        let n = self.workers.len();
        for step in 0..n {
            let idx = (self.round_robin + step) % n;
            if self.workers[idx].state != WorkerState::Error {
                self.round_robin = (idx + 1) % n;
                return Err(WorkerError::Busy {
                    worker: self.workers[idx].id,
                });
            }
        }
        Err(WorkerError::NoWorkers)
    }

    fn submit(
        &mut self,
        idx: usize,
        command: WorkerCommand,
    ) -> Result<(String, oneshot::Receiver<Result<WorkerReply, WorkerError>>), WorkerError> {
        let id = self.next_request_id();
        let slot = &mut self.workers[idx];
        slot.requests
            .try_send(WorkerRequest {
                id: id.clone(),
                command,
            })
            .map_err(|e| match e {
                std_mpsc::TrySendError::Full(_) => WorkerError::Busy { worker: slot.id },
                std_mpsc::TrySendError::Disconnected(_) => WorkerError::WorkerFailed {
                    worker: slot.id,
                    message: "worker thread is gone".to_string(),
                },
            })?;

        let (tx, rx) = oneshot::channel();
        slot.pending.insert(
            id.clone(),
            Pending {
                started: Instant::now(),
                reply: tx,
            },
        );
        slot.state = WorkerState::Busy;
        Ok((id, rx))
    }

    /// Drop a pending entry. The worker stays Busy until its late answer
    /// arrives, since its thread is still working on the request.
    fn forget(&mut self, request_id: &str) -> bool {
        self.workers
            .iter_mut()
            .any(|slot| slot.pending.remove(request_id).is_some())
    }
}

fn lock(inner: &Mutex<PoolInner>) -> MutexGuard<'_, PoolInner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

/// Fixed-size pool of frame extraction threads.
pub struct WorkerPool {
    inner: Arc<Mutex<PoolInner>>,
    events: broadcast::Sender<PoolEvent>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    /// Start `config.worker_count()` workers. Must be called inside a tokio
    /// runtime; routers run as tasks on it.
    pub fn new(config: WorkerPoolConfig) -> Result<Self, WorkerError> {
        let runtime = Handle::try_current().map_err(|e| WorkerError::WorkerFailed {
            worker: 0,
            message: format!("no tokio runtime: {}", e),
        })?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Mutex::new(PoolInner {
            workers: Vec::new(),
            next_request: 0,
            round_robin: 0,
            destroyed: false,
            last_config: None,
            counters: Counters::default(),
        }));

        let count = config.worker_count();
        for id in 0..count {
            let slot = spawn_worker(id, 0, &inner, &events, &runtime)?;
            lock(&inner).workers.push(slot);
        }

        info!("[workers] Pool initialized with {} worker(s)", count);
        let _ = events.send(PoolEvent::PoolInitialized { workers: count });

        Ok(WorkerPool {
            inner,
            events,
            config,
        })
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.inner).destroyed
    }

    pub fn worker_count(&self) -> usize {
        lock(&self.inner).workers.len()
    }

    /// Send one command to a selected worker and wait for the answer.
    pub(crate) async fn request(
        &self,
        command: WorkerCommand,
        timeout: Duration,
    ) -> Result<WorkerReply, WorkerError> {
        let submitted = {
            let mut inner = lock(&self.inner);
            if inner.destroyed {
                return Err(WorkerError::Destroyed);
            }
            let idx = inner.select()?;
            inner.submit(idx, command)?
        };
        self.await_reply(submitted, timeout).await
    }

    async fn await_reply(
        &self,
        (request_id, rx): (String, oneshot::Receiver<Result<WorkerReply, WorkerError>>),
        timeout: Duration,
    ) -> Result<WorkerReply, WorkerError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without an answer: the pool went away
            Ok(Err(_)) => Err(WorkerError::Destroyed),
            Err(_) => {
                let mut inner = lock(&self.inner);
                inner.forget(&request_id);
                inner.counters.timeouts += 1;
                warn!(
                    "[workers] Request {} timed out after {}ms",
                    request_id,
                    timeout.as_millis()
                );
                Err(WorkerError::Timeout {
                    request_id,
                    after: timeout,
                })
            }
        }
    }

    /// Send `command` to every live worker and wait for all answers.
    async fn broadcast(
        &self,
        command: impl Fn() -> WorkerCommand,
    ) -> Result<Vec<WorkerReply>, WorkerError> {
        let submitted = {
            let mut inner = lock(&self.inner);
            if inner.destroyed {
                return Err(WorkerError::Destroyed);
            }
            let mut submitted = Vec::new();
            for idx in 0..inner.workers.len() {
                if inner.workers[idx].state != WorkerState::Error {
                    submitted.push(inner.submit(idx, command())?);
                }
            }
            submitted
        };
        if submitted.is_empty() {
            return Err(WorkerError::NoWorkers);
        }

        let timeout = self.config.request_timeout();
        join_all(
            submitted
                .into_iter()
                .map(|s| self.await_reply(s, timeout)),
        )
        .await
        .into_iter()
        .collect()
    }

    /// Extract frames from `data` on a worker, with the default timeout.
    pub async fn process_data(&self, data: &[u8]) -> Result<ProcessedChunk, WorkerError> {
        self.process_data_with_timeout(data, self.config.request_timeout())
            .await
    }

    pub async fn process_data_with_timeout(
        &self,
        data: &[u8],
        timeout: Duration,
    ) -> Result<ProcessedChunk, WorkerError> {
        match self
            .request(WorkerCommand::ProcessData(data.to_vec()), timeout)
            .await?
        {
            WorkerReply::FrameProcessed {
                frames,
                checksum_errors,
            } => Ok(ProcessedChunk {
                frames,
                checksum_errors,
            }),
            other => Err(WorkerError::Processing(format!(
                "unexpected reply {:?}",
                other
            ))),
        }
    }

    /// Hand the chunk to an idle worker for a self-contained extraction.
    /// No worker buffer carries over between calls, so any worker can take
    /// the next chunk.
    pub async fn extract_chunk(
        &self,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<ExtractedChunk, WorkerError> {
        match self.request(WorkerCommand::ExtractChunk(data), timeout).await? {
            WorkerReply::ChunkExtracted {
                frames,
                consumed,
                checksum_errors,
            } => Ok(ExtractedChunk {
                frames,
                consumed,
                checksum_errors,
            }),
            other => Err(WorkerError::Processing(format!(
                "unexpected reply {:?}",
                other
            ))),
        }
    }

    /// Process chunks concurrently, one per idle worker; results are in
    /// input order. Chunks beyond the idle workers fail with `Busy`.
    pub async fn process_batch(
        &self,
        chunks: &[Vec<u8>],
    ) -> Vec<Result<ProcessedChunk, WorkerError>> {
        join_all(chunks.iter().map(|chunk| self.process_data(chunk))).await
    }

    /// Apply `config` on every worker. Replacement workers inherit it.
    pub async fn configure_workers(&self, config: FrameDetectionConfig) -> Result<(), WorkerError> {
        lock(&self.inner).last_config = Some(config.clone());
        for reply in self
            .broadcast(|| WorkerCommand::Configure(config.clone()))
            .await?
        {
            if reply != WorkerReply::Configured {
                return Err(WorkerError::Processing(format!(
                    "unexpected reply {:?}",
                    reply
                )));
            }
        }
        Ok(())
    }

    /// Queue `config` on every worker without waiting for it to be applied.
    /// Requests submitted afterwards see the new configuration.
    pub fn configure_in_background(&self, config: FrameDetectionConfig) -> Result<(), WorkerError> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        if inner.destroyed {
            return Err(WorkerError::Destroyed);
        }
        inner.last_config = Some(config.clone());
        for idx in 0..inner.workers.len() {
            let id = inner.next_request_id();
            let slot = &mut inner.workers[idx];
            if slot.state == WorkerState::Error {
                continue;
            }
            slot.queue_configure(id, config.clone())
                .map_err(|_| WorkerError::Busy { worker: slot.id })?;
        }
        Ok(())
    }

    /// Clear every worker's buffer and sequence counter.
    pub async fn reset_workers(&self) -> Result<(), WorkerError> {
        self.broadcast(|| WorkerCommand::Reset).await.map(|_| ())
    }

    /// Extractor buffer statistics from every live worker
    pub async fn buffer_stats(&self) -> Result<Vec<ExtractorStats>, WorkerError> {
        Ok(self
            .broadcast(|| WorkerCommand::GetStats)
            .await?
            .into_iter()
            .filter_map(|reply| match reply {
                WorkerReply::Stats(stats) => Some(stats),
                _ => None,
            })
            .collect())
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let inner = lock(&self.inner);
        let count = |state: WorkerState| inner.workers.iter().filter(|w| w.state == state).count();
        let c = &inner.counters;
        WorkerPoolStats {
            total_workers: inner.workers.len(),
            idle_workers: count(WorkerState::Idle),
            busy_workers: count(WorkerState::Busy),
            error_workers: count(WorkerState::Error),
            pending_requests: inner.workers.iter().map(|w| w.pending.len()).sum(),
            completed_requests: c.completed,
            failed_requests: c.failed,
            timeouts: c.timeouts,
            respawns: c.respawns,
            average_response_ms: if c.completed > 0 {
                c.total_response.as_secs_f64() * 1000.0 / c.completed as f64
            } else {
                0.0
            },
            workers: inner
                .workers
                .iter()
                .map(|w| WorkerInfo {
                    id: w.id,
                    state: w.state,
                    pending_requests: w.pending.len(),
                    completed_requests: w.completed,
                })
                .collect(),
        }
    }

    /// Reject everything pending with [`WorkerError::Destroyed`] and stop
    /// every worker. Returns how many requests were rejected.
    pub fn destroy(&self) -> usize {
        let workers = {
            let mut inner = lock(&self.inner);
            if inner.destroyed {
                return 0;
            }
            inner.destroyed = true;
            std::mem::take(&mut inner.workers)
        };

        let mut rejected = 0;
        for slot in workers {
            slot.router.abort();
            for (_, pending) in slot.pending {
                // Background configures have nobody waiting
                if pending.reply.is_closed() {
                    continue;
                }
                let _ = pending.reply.send(Err(WorkerError::Destroyed));
                rejected += 1;
            }
            // Dropping the request sender ends the thread once it is idle
        }
        info!("[workers] Pool destroyed ({} pending request(s) rejected)", rejected);
        rejected
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ============================================================================
// Worker lifecycle
// ============================================================================

fn spawn_worker(
    id: usize,
    generation: u64,
    inner: &Arc<Mutex<PoolInner>>,
    events: &broadcast::Sender<PoolEvent>,
    runtime: &Handle,
) -> Result<WorkerSlot, WorkerError> {
    let (req_tx, req_rx) = std_mpsc::sync_channel(WORKER_QUEUE_DEPTH + CONTROL_QUEUE_DEPTH);
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let thread = processor::spawn(id, req_rx, out_tx).map_err(|e| WorkerError::WorkerFailed {
        worker: id,
        message: format!("failed to start thread: {}", e),
    })?;
    let router = runtime.spawn(route(
        Arc::downgrade(inner),
        events.clone(),
        runtime.clone(),
        id,
        generation,
        out_rx,
    ));

    Ok(WorkerSlot {
        id,
        generation,
        state: WorkerState::Idle,
        requests: req_tx,
        pending: HashMap::new(),
        completed: 0,
        router,
        _thread: thread,
    })
}

/// Match one worker's responses to pending callers until it stops.
async fn route(
    pool: Weak<Mutex<PoolInner>>,
    events: broadcast::Sender<PoolEvent>,
    runtime: Handle,
    worker: usize,
    generation: u64,
    mut output: mpsc::UnboundedReceiver<WorkerOutput>,
) {
    while let Some(message) = output.recv().await {
        let Some(inner) = pool.upgrade() else {
            return;
        };
        match message {
            WorkerOutput::Response(response) => {
                complete(&inner, &events, worker, generation, response);
            }
            WorkerOutput::Fault(message) => {
                replace_worker(&inner, &events, &runtime, worker, generation, message);
                return;
            }
        }
    }

    if let Some(inner) = pool.upgrade() {
        replace_worker(
            &inner,
            &events,
            &runtime,
            worker,
            generation,
            "worker thread exited".to_string(),
        );
    }
}

fn complete(
    inner: &Mutex<PoolInner>,
    events: &broadcast::Sender<PoolEvent>,
    worker: usize,
    generation: u64,
    response: WorkerResponse,
) {
    let mut guard = lock(inner);
    let inner = &mut *guard;
    let Some(idx) = inner.slot_index(worker, generation) else {
        return;
    };
    let slot = &mut inner.workers[idx];
    let Some(pending) = slot.pending.remove(&response.id) else {
        warn!(
            "[workers] Dropping unmatched response {} from worker {}",
            response.id, worker
        );
        if slot.pending.is_empty() && slot.state == WorkerState::Busy {
            slot.state = WorkerState::Idle;
        }
        return;
    };
    slot.state = if slot.pending.is_empty() {
        WorkerState::Idle
    } else {
        WorkerState::Busy
    };

    match response.reply {
        WorkerReply::Error(message) => {
            inner.counters.failed += 1;
            warn!("[workers] Request {} failed: {}", response.id, message);
            let _ = events.send(PoolEvent::ProcessingError {
                request_id: response.id,
                message: message.clone(),
            });
            let _ = pending.reply.send(Err(WorkerError::Processing(message)));
        }
        reply => {
            slot.completed += 1;
            inner.counters.completed += 1;
            inner.counters.total_response += pending.started.elapsed();
            let _ = pending.reply.send(Ok(reply));
        }
    }
}

/// Fail a dead worker's pending requests and put a fresh worker in its slot.
fn replace_worker(
    inner_arc: &Arc<Mutex<PoolInner>>,
    events: &broadcast::Sender<PoolEvent>,
    runtime: &Handle,
    worker: usize,
    generation: u64,
    message: String,
) {
    let mut guard = lock(inner_arc);
    let inner = &mut *guard;
    if inner.destroyed {
        return;
    }
    let Some(idx) = inner.slot_index(worker, generation) else {
        return;
    };

    let slot = &mut inner.workers[idx];
    slot.state = WorkerState::Error;
    let pending = std::mem::take(&mut slot.pending);
    inner.counters.failed += pending.len() as u64;
    for (_, p) in pending {
        let _ = p.reply.send(Err(WorkerError::WorkerFailed {
            worker,
            message: message.clone(),
        }));
    }

    warn!("[workers] Worker {} failed ({}), respawning", worker, message);
    let _ = events.send(PoolEvent::WorkerError {
        worker,
        message: message.clone(),
    });

    let mut replacement = match spawn_worker(worker, generation + 1, inner_arc, events, runtime) {
        Ok(slot) => slot,
        Err(e) => {
            error!("[workers] Could not respawn worker {}: {}", worker, e);
            return;
        }
    };
    inner.counters.respawns += 1;

    if let Some(config) = inner.last_config.clone() {
        let id = inner.next_request_id();
        if let Err(e) = replacement.queue_configure(id, config) {
            error!("[workers] Could not configure worker {}: {}", worker, e);
        }
    }

    inner.workers[idx] = replacement;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FrameDetectionMode;

    fn pool(workers: usize) -> WorkerPool {
        WorkerPool::new(WorkerPoolConfig {
            max_workers: Some(workers),
            request_timeout_ms: 2000,
            threaded_extraction: true,
        })
        .unwrap()
    }

    async fn wait_idle(pool: &WorkerPool, workers: usize) {
        for _ in 0..200 {
            if pool.stats().idle_workers == workers {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workers never became idle");
    }

    fn braces() -> FrameDetectionConfig {
        FrameDetectionConfig {
            mode: FrameDetectionMode::StartAndEndDelimiter,
            start_sequence: b"{".to_vec(),
            finish_sequence: b"}".to_vec(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_process_data_default_config() {
        let pool = pool(2);
        assert_eq!(pool.worker_count(), 2);

        let chunk = pool.process_data(b"a,1\nb,2\nc,3\n").await.unwrap();
        let data: Vec<&[u8]> = chunk.frames.iter().map(|f| f.data.as_slice()).collect();
        assert_eq!(data, vec![&b"a,1"[..], b"b,2", b"c,3"]);
        assert_eq!(chunk.checksum_errors, 0);

        let stats = pool.stats();
        assert_eq!(stats.completed_requests, 1);
        assert_eq!(stats.idle_workers, 2);
        assert_eq!(stats.pending_requests, 0);
    }

    #[tokio::test]
    async fn test_configure_reaches_every_worker() {
        let pool = pool(3);
        pool.configure_workers(braces()).await.unwrap();

        let results = pool
            .process_batch(&[b"{x:1}".to_vec(), b"{y:2}".to_vec(), b"{z:3}".to_vec()])
            .await;
        let frames: Vec<Vec<u8>> = results
            .into_iter()
            .map(|r| r.unwrap().frames.remove(0).data)
            .collect();
        assert_eq!(frames, vec![b"x:1".to_vec(), b"y:2".to_vec(), b"z:3".to_vec()]);
    }

    #[tokio::test]
    async fn test_background_configure_applies_before_later_requests() {
        let pool = pool(2);
        pool.configure_in_background(braces()).unwrap();
        wait_idle(&pool, 2).await;
        let chunk = pool.process_data(b"{q}").await.unwrap();
        assert_eq!(chunk.frames[0].data, b"q");
    }

    #[tokio::test]
    async fn test_sequential_submission_keeps_partial_frames() {
        let pool = pool(2);
        assert!(pool.process_data(b"a,").await.unwrap().frames.is_empty());
        let chunk = pool.process_data(b"1\n").await.unwrap();
        assert_eq!(chunk.frames[0].data, b"a,1");
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_entry() {
        let pool = pool(1);
        let err = pool
            .request(
                WorkerCommand::Stall(Duration::from_millis(300)),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.is_destroyed());

        let stats = pool.stats();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.pending_requests, 0);
        // Still working on the stalled request
        assert_eq!(stats.busy_workers, 1);
        assert_eq!(
            pool.process_data(b"ok\n").await.unwrap_err(),
            WorkerError::Busy { worker: 0 }
        );

        // The late answer is dropped and the worker serves again
        wait_idle(&pool, 1).await;
        let chunk = pool.process_data(b"ok\n").await.unwrap();
        assert_eq!(chunk.frames[0].data, b"ok");
    }

    #[tokio::test]
    async fn test_worker_panic_is_replaced_and_reconfigured() {
        let pool = pool(2);
        let mut events = pool.subscribe();
        pool.configure_workers(braces()).await.unwrap();

        let err = pool
            .request(WorkerCommand::Panic, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::WorkerFailed { .. }));

        match tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            PoolEvent::WorkerError { message, .. } => {
                assert_eq!(message, "scripted worker panic")
            }
            other => panic!("unexpected event {:?}", other),
        }

        let stats = pool.stats();
        assert_eq!(stats.total_workers, 2);
        assert_eq!(stats.respawns, 1);
        assert_eq!(stats.error_workers, 0);

        // Every worker, including the replacement, frames with braces
        wait_idle(&pool, 2).await;
        let results = pool
            .process_batch(&[b"{a}".to_vec(), b"{b}".to_vec()])
            .await;
        for result in results {
            assert_eq!(result.unwrap().frames.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_destroy_rejects_in_flight_requests() {
        let pool = Arc::new(pool(3));
        let mut tasks = Vec::new();
        for _ in 0..3 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                pool.request(
                    WorkerCommand::Stall(Duration::from_millis(500)),
                    Duration::from_secs(5),
                )
                .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(pool.destroy(), 3);
        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert_eq!(err, WorkerError::Destroyed);
        }

        assert_eq!(
            pool.process_data(b"late\n").await.unwrap_err(),
            WorkerError::Destroyed
        );
        assert_eq!(pool.destroy(), 0);
    }

    #[tokio::test]
    async fn test_busy_worker_fails_fast() {
        let pool = Arc::new(pool(1));
        let stalled = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.request(
                    WorkerCommand::Stall(Duration::from_millis(300)),
                    Duration::from_secs(2),
                )
                .await
            })
        };
        for _ in 0..100 {
            if pool.stats().busy_workers == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let started = Instant::now();
        assert_eq!(
            pool.process_data(b"x\n").await.unwrap_err(),
            WorkerError::Busy { worker: 0 }
        );
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(pool.stats().pending_requests, 1);

        assert_eq!(stalled.await.unwrap(), Ok(WorkerReply::Reset));
        let chunk = pool.process_data(b"x\n").await.unwrap();
        assert_eq!(chunk.frames[0].data, b"x");
    }

    #[tokio::test]
    async fn test_destroy_skips_background_configures() {
        let pool = pool(2);
        pool.configure_in_background(braces()).unwrap();
        assert_eq!(pool.destroy(), 0);
        assert!(pool.is_destroyed());
    }

    #[tokio::test]
    async fn test_extract_chunk_is_self_contained() {
        let pool = pool(1);
        pool.process_data(b"held").await.unwrap();

        let chunk = pool
            .extract_chunk(b"a\nb".to_vec(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(chunk.frames.len(), 1);
        assert_eq!(chunk.frames[0].data, b"a");
        assert_eq!(chunk.consumed, 2);

        let stats = pool.buffer_stats().await.unwrap();
        assert_eq!(stats[0].buffered, 4);
    }

    #[tokio::test]
    async fn test_reset_and_buffer_stats() {
        let pool = pool(2);
        pool.process_data(b"partial").await.unwrap();
        let stats = pool.buffer_stats().await.unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats.iter().map(|s| s.buffered).sum::<usize>(), 7);

        pool.reset_workers().await.unwrap();
        let stats = pool.buffer_stats().await.unwrap();
        assert!(stats.iter().all(|s| s.buffered == 0));
    }
}
