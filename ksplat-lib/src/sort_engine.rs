use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::error::{Result, SortError};
use crate::sort::{
    sort_pass, RequestOutcome, SchedulerState, SortConfig, SortScheduler, SortView, SortedSplats,
};
use crate::splat_buffer::PrecomputedSplats;

pub const WORKER_THREAD_NAME: &str = "ksplat-sort";

#[derive(Debug, Clone, PartialEq)]
pub struct SortResponse {
    /// Sequence number of the pass on the worker, starting at 0.
    pub id: u64,
    pub view: SortView,
    pub outcome: std::result::Result<SortedSplats, SortError>,
}

type PassFn = dyn Fn(&PrecomputedSplats, &SortView, &SortConfig) -> SortedSplats + Send;

type SharedScheduler = Arc<Mutex<SortScheduler>>;

pub struct SortEngine {
    scheduler: SharedScheduler,
    splats: Arc<PrecomputedSplats>,
    requests: Option<Sender<SortView>>,
    responses: Receiver<SortResponse>,
    worker: Option<JoinHandle<()>>,
    passes: u64,
    failed: Option<SortResponse>,
}

#[inline]
fn lock(scheduler: &Mutex<SortScheduler>) -> MutexGuard<'_, SortScheduler> {
    // passes run outside the lock, so a poisoned scheduler is still consistent
    scheduler.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn run_worker(
    splats: Arc<PrecomputedSplats>,
    config: SortConfig,
    pass: Box<PassFn>,
    scheduler: SharedScheduler,
    requests: Receiver<SortView>,
    responses: Sender<SortResponse>,
) {
    let mut id = 0u64;
    while let Ok(started) = requests.recv() {
        let mut next = Some(started);
        while let Some(view) = next {
            let outcome = {
                let _span = tracing::trace_span!("sort_request", id).entered();
                panic::catch_unwind(AssertUnwindSafe(|| pass(&splats, &view, &config)))
                    .map_err(|payload| SortError::PassPanicked(panic_message(payload.as_ref())))
            };
            if let Err(err) = &outcome {
                warn!(id, %err, "sort pass failed");
            }

            // the response is queued before the caller can observe the new state
            let mut guard = lock(&scheduler);
            next = match outcome {
                Ok(_) => guard.complete(),
                Err(_) => guard.abort(),
            };
            if responses.send(SortResponse { id, view, outcome }).is_err() {
                return;
            }
            drop(guard);
            id += 1;
        }
    }
    debug!("sort worker exiting");
}

impl SortEngine {
    pub fn new(splats: Arc<PrecomputedSplats>, config: SortConfig) -> Result<Self> {
        Self::with_pass(splats, config, sort_pass)
    }

    /// Runs `pass` on the worker in place of [`sort_pass`].
    pub fn with_pass<F>(splats: Arc<PrecomputedSplats>, config: SortConfig, pass: F) -> Result<Self>
    where
        F: Fn(&PrecomputedSplats, &SortView, &SortConfig) -> SortedSplats + Send + 'static,
    {
        let (request_tx, request_rx) = mpsc::channel();
        let (response_tx, response_rx) = mpsc::channel();
        let scheduler = Arc::new(Mutex::new(SortScheduler::new(config)));
        let worker_splats = Arc::clone(&splats);
        let worker_scheduler = Arc::clone(&scheduler);
        let worker = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                run_worker(
                    worker_splats,
                    config,
                    Box::new(pass),
                    worker_scheduler,
                    request_rx,
                    response_tx,
                )
            })?;
        debug!(splats = splats.len(), "started sort worker");

        Ok(Self {
            scheduler,
            splats,
            requests: Some(request_tx),
            responses: response_rx,
            worker: Some(worker),
            passes: 0,
            failed: None,
        })
    }

    pub fn splats(&self) -> &Arc<PrecomputedSplats> {
        &self.splats
    }

    pub fn state(&self) -> SchedulerState {
        lock(&self.scheduler).state()
    }

    /// Number of finished passes received by this engine, failed ones included.
    pub fn passes_executed(&self) -> u64 {
        self.passes
    }

    /// Coalesced views run on the worker as soon as the in-flight pass ends,
    /// whether or not the caller polls in between.
    pub fn request(&mut self, view: SortView) -> RequestOutcome {
        let outcome = lock(&self.scheduler).request(view);
        if outcome == RequestOutcome::Started {
            let sent = self
                .requests
                .as_ref()
                .is_some_and(|tx| tx.send(view).is_ok());
            if !sent {
                self.disconnected(view);
            }
        }
        outcome
    }

    fn disconnected(&mut self, view: SortView) {
        warn!("sort worker disconnected");
        lock(&self.scheduler).reset();
        self.failed = Some(SortResponse {
            id: self.passes,
            view,
            outcome: Err(SortError::WorkerDisconnected),
        });
    }

    fn handle(&mut self, response: SortResponse) -> SortResponse {
        self.passes += 1;
        if let Ok(sorted) = &response.outcome {
            debug!(id = response.id, splats = sorted.len(), "sort pass finished");
        }
        response
    }

    /// Latest finished pass, if any finished since the last call. Never blocks.
    pub fn poll(&mut self) -> Option<SortResponse> {
        let mut latest = None;
        loop {
            match self.responses.try_recv() {
                Ok(response) => latest = Some(self.handle(response)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    let running = lock(&self.scheduler).running_view();
                    if let Some(view) = running {
                        self.disconnected(view);
                    }
                    break;
                }
            }
        }
        self.failed.take().or(latest)
    }

    /// Blocks until no pass is running or pending and returns the last one finished.
    pub fn wait(&mut self) -> Option<SortResponse> {
        let mut latest = None;
        while self.state() != SchedulerState::Idle {
            match self.responses.recv() {
                Ok(response) => latest = Some(self.handle(response)),
                Err(_) => {
                    let running = lock(&self.scheduler).running_view();
                    match running {
                        Some(view) => self.disconnected(view),
                        None => lock(&self.scheduler).reset(),
                    }
                }
            }
        }
        // responses sent while the worker went idle are already queued
        self.poll().or(latest)
    }
}

impl Drop for SortEngine {
    fn drop(&mut self) {
        // closing the channel ends the worker loop
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("sort worker panicked outside a pass");
            }
        }
    }
}
