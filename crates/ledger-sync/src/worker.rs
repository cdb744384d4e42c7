//! Decode worker pool
//!
//! One decode task per generation, driven by messages. The control loop owns
//! the pool and is the only caller; the worker task only sees its requests and
//! answers through the shared event channel. Every event carries the
//! generation that produced it so results from a retired worker are dropped.
//!
//! Lifecycle: `Uninitialized -> Ready -> Busy -> Ready -> ... -> Retired`.
//! A generation is retired unconditionally after a fixed number of batches,
//! or earlier when an in-flight batch outlives the dead-worker timeout.

use crate::error::{DecodeError, Error};
use crate::types::{DecodedTransaction, RawTransactionRecord};
use crate::wallet::{TransactionDecoder, ViewStateSnapshot};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Message to a decode worker
#[derive(Debug)]
pub enum WorkerRequest {
    /// Load the wallet view state
    InitWallet(Box<ViewStateSnapshot>),
    /// Decode one batch
    Process(Vec<RawTransactionRecord>),
}

/// Message from a decode worker
#[derive(Debug)]
pub enum WorkerEvent {
    /// Worker task started and waits for the wallet
    Ready {
        /// Worker generation
        generation: u64,
    },
    /// Wallet loaded; batches may be dispatched
    ReadyWallet {
        /// Worker generation
        generation: u64,
    },
    /// Batch decoded
    Processed {
        /// Worker generation
        generation: u64,
        /// Wallet-relevant transactions, in record order
        transactions: Vec<DecodedTransaction>,
        /// Height of the last record in the batch
        last_height_seen: Option<u64>,
        /// Records that failed to decode
        failures: Vec<DecodeError>,
    },
}

impl WorkerEvent {
    /// Generation that produced this event
    pub fn generation(&self) -> u64 {
        match self {
            WorkerEvent::Ready { generation }
            | WorkerEvent::ReadyWallet { generation }
            | WorkerEvent::Processed { generation, .. } => *generation,
        }
    }
}

/// Worker generation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, wallet not loaded yet
    Uninitialized,
    /// Idle with wallet loaded
    Ready,
    /// One batch in flight
    Busy,
    /// Torn down
    Retired,
}

/// What the control loop should do after an event
#[derive(Debug)]
pub enum PoolUpdate {
    /// New generation started; send it the wallet view state
    NeedsWallet,
    /// Wallet loaded; dispatch may begin
    WalletLoaded,
    /// In-flight batch finished
    BatchDone(BatchOutcome),
    /// Event from a retired generation or out of sequence; ignored
    Stale,
}

/// Result of one decoded batch
#[derive(Debug)]
pub struct BatchOutcome {
    /// Wallet-relevant transactions, in record order
    pub transactions: Vec<DecodedTransaction>,
    /// Height of the last record in the batch
    pub last_height_seen: Option<u64>,
    /// Records that failed to decode
    pub failures: Vec<DecodeError>,
    /// Records in the batch
    pub records: usize,
    /// Dispatch to completion
    pub elapsed: Duration,
}

/// Batch handed back by a refused dispatch
#[derive(Debug)]
pub struct DispatchRefused {
    /// Why the dispatch was refused
    pub error: Error,
    /// The untouched batch
    pub batch: Vec<RawTransactionRecord>,
}

struct InFlight {
    records: usize,
    dispatched_at: Instant,
}

struct WorkerHandle {
    requests: mpsc::Sender<WorkerRequest>,
    task: JoinHandle<()>,
}

/// Decode worker pool
pub struct DecodeWorkerPool<D> {
    decoder: Arc<D>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    worker: Option<WorkerHandle>,
    generation: u64,
    state: WorkerState,
    batches_dispatched: u32,
    recycle_after: u32,
    timeout: Option<Duration>,
    in_flight: Option<InFlight>,
}

impl<D: TransactionDecoder> DecodeWorkerPool<D> {
    /// Create a pool; no worker runs until [`DecodeWorkerPool::start`]
    pub fn new(decoder: Arc<D>, recycle_after: u32, timeout: Option<Duration>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            decoder,
            events_tx,
            events_rx,
            worker: None,
            generation: 0,
            state: WorkerState::Retired,
            batches_dispatched: 0,
            recycle_after: recycle_after.max(1),
            timeout,
            in_flight: None,
        }
    }

    /// Spawn a fresh worker generation
    pub fn start(&mut self) {
        self.retire();
        self.generation += 1;

        // Single slot: at most one request waits behind the one being handled
        let (requests_tx, requests_rx) = mpsc::channel(1);
        let task = tokio::spawn(run_worker(
            self.generation,
            Arc::clone(&self.decoder),
            requests_rx,
            self.events_tx.clone(),
        ));

        self.worker = Some(WorkerHandle {
            requests: requests_tx,
            task,
        });
        self.state = WorkerState::Uninitialized;
        debug!(generation = self.generation, "Decode worker spawned");
    }

    /// Tear down the current generation and start a new one
    pub fn recycle(&mut self) {
        info!(
            event = "worker_recycle",
            generation = self.generation,
            batches = self.batches_dispatched,
            "Recycling decode worker"
        );
        self.start();
    }

    /// Tear down the current generation without replacing it
    pub fn retire(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.task.abort();
        }
        self.state = WorkerState::Retired;
        self.in_flight = None;
        self.batches_dispatched = 0;
    }

    /// Hand the wallet view state to the current generation
    pub fn init_wallet(&mut self, snapshot: ViewStateSnapshot) -> Result<(), Error> {
        let worker = self.worker.as_ref().ok_or(Error::WorkerUnavailable)?;
        if self.state == WorkerState::Busy {
            return Err(Error::WorkerUnavailable);
        }
        worker
            .requests
            .try_send(WorkerRequest::InitWallet(Box::new(snapshot)))
            .map_err(|_| Error::WorkerUnavailable)?;
        self.state = WorkerState::Uninitialized;
        Ok(())
    }

    /// Send a batch to the worker.
    ///
    /// Refused with [`Error::WorkerUnavailable`] unless the worker is `Ready`;
    /// the batch comes back untouched so the caller can requeue it.
    pub fn dispatch(&mut self, batch: Vec<RawTransactionRecord>) -> Result<(), DispatchRefused> {
        if self.state != WorkerState::Ready || self.recycle_due() {
            return Err(DispatchRefused {
                error: Error::WorkerUnavailable,
                batch,
            });
        }
        let Some(worker) = self.worker.as_ref() else {
            return Err(DispatchRefused {
                error: Error::WorkerUnavailable,
                batch,
            });
        };

        let records = batch.len();
        if let Err(e) = worker.requests.try_send(WorkerRequest::Process(batch)) {
            let batch = match e.into_inner() {
                WorkerRequest::Process(batch) => batch,
                WorkerRequest::InitWallet(_) => Vec::new(),
            };
            return Err(DispatchRefused {
                error: Error::WorkerUnavailable,
                batch,
            });
        }

        self.batches_dispatched += 1;
        self.state = WorkerState::Busy;
        self.in_flight = Some(InFlight {
            records,
            dispatched_at: Instant::now(),
        });
        debug!(generation = self.generation, records, "Batch dispatched");
        Ok(())
    }

    /// Wait for the next worker event
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.events_rx.recv().await
    }

    /// Apply a worker event to the pool state
    pub fn handle_event(&mut self, event: WorkerEvent) -> PoolUpdate {
        if event.generation() != self.generation || self.state == WorkerState::Retired {
            debug!(
                event_generation = event.generation(),
                generation = self.generation,
                "Dropping event from retired worker"
            );
            return PoolUpdate::Stale;
        }

        match event {
            WorkerEvent::Ready { .. } => PoolUpdate::NeedsWallet,
            WorkerEvent::ReadyWallet { .. } => {
                if self.state == WorkerState::Busy {
                    return PoolUpdate::Stale;
                }
                self.state = WorkerState::Ready;
                PoolUpdate::WalletLoaded
            }
            WorkerEvent::Processed {
                transactions,
                last_height_seen,
                failures,
                ..
            } => {
                let Some(in_flight) = self.in_flight.take() else {
                    return PoolUpdate::Stale;
                };
                self.state = WorkerState::Ready;
                PoolUpdate::BatchDone(BatchOutcome {
                    transactions,
                    last_height_seen,
                    failures,
                    records: in_flight.records,
                    elapsed: in_flight.dispatched_at.elapsed(),
                })
            }
        }
    }

    /// Whether the batch quota for this generation is used up
    pub fn recycle_due(&self) -> bool {
        self.batches_dispatched >= self.recycle_after
    }

    /// Whether the in-flight batch has outlived the dead-worker timeout
    pub fn in_flight_expired(&self) -> bool {
        match (&self.in_flight, self.timeout) {
            (Some(in_flight), Some(timeout)) => in_flight.dispatched_at.elapsed() >= timeout,
            _ => false,
        }
    }

    /// Current state
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Whether a batch may be dispatched now
    pub fn is_ready(&self) -> bool {
        self.state == WorkerState::Ready
    }

    /// Whether a batch is in flight
    pub fn is_busy(&self) -> bool {
        self.state == WorkerState::Busy
    }

    /// Current generation number
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Batches dispatched by the current generation
    pub fn batches_dispatched(&self) -> u32 {
        self.batches_dispatched
    }
}

impl<D> Drop for DecodeWorkerPool<D> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.task.abort();
        }
    }
}

async fn run_worker<D: TransactionDecoder>(
    generation: u64,
    decoder: Arc<D>,
    mut requests: mpsc::Receiver<WorkerRequest>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    if events.send(WorkerEvent::Ready { generation }).is_err() {
        return;
    }

    let mut view: Option<Arc<ViewStateSnapshot>> = None;

    while let Some(request) = requests.recv().await {
        let event = match request {
            WorkerRequest::InitWallet(snapshot) => {
                view = Some(Arc::new(*snapshot));
                WorkerEvent::ReadyWallet { generation }
            }
            WorkerRequest::Process(batch) => {
                let last_height_seen = batch.last().and_then(|r| r.height);
                let (transactions, failures) = match view.clone() {
                    Some(view) => {
                        let decoder = Arc::clone(&decoder);
                        tokio::task::spawn_blocking(move || {
                            decode_batch(decoder.as_ref(), &view, &batch)
                        })
                        .await
                        .unwrap_or_else(|e| {
                            warn!(generation, error = %e, "Decode task failed");
                            (Vec::new(), Vec::new())
                        })
                    }
                    None => {
                        warn!(generation, "Batch received before wallet; skipping");
                        (Vec::new(), Vec::new())
                    }
                };
                WorkerEvent::Processed {
                    generation,
                    transactions,
                    last_height_seen,
                    failures,
                }
            }
        };

        if events.send(event).is_err() {
            break;
        }
    }
}

/// Decode every record, isolating failures and panics per record
pub(crate) fn decode_batch<D: TransactionDecoder + ?Sized>(
    decoder: &D,
    view: &ViewStateSnapshot,
    batch: &[RawTransactionRecord],
) -> (Vec<DecodedTransaction>, Vec<DecodeError>) {
    let mut transactions = Vec::new();
    let mut failures = Vec::new();

    for record in batch {
        if let Some(reason) = &record.parse_error {
            debug!(hash = %record.hash, %reason, "Unreadable record skipped");
            failures.push(DecodeError::Malformed {
                hash: record.hash.clone(),
                reason: reason.clone(),
            });
            continue;
        }
        match catch_unwind(AssertUnwindSafe(|| decoder.decode(view, record))) {
            Ok(Ok(Some(tx))) => transactions.push(tx),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                debug!(hash = %record.hash, error = %e, "Record failed to decode");
                failures.push(e);
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                warn!(hash = %record.hash, %message, "Decoder panicked");
                failures.push(DecodeError::Panicked {
                    hash: record.hash.clone(),
                    message,
                });
            }
        }
    }

    (transactions, failures)
}
