//! Run orchestration
//!
//! A [`SoapEngine`] runs one action at a time. Each run freezes the action into
//! an [`ActionStamp`], then loops over connection attempts: the response body
//! is pushed fragment by fragment through an [`ExtractingDecoder`], extraction
//! events are dispatched to the delegate (inline or on a single ordered worker
//! task) and transport failures are retried per the stamp's [`RetryPolicy`].
//!
//! [`RetryPolicy`]: crate::retry::RetryPolicy

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::action::{SoapAction, SoapRequest};
use crate::delegate::{ResponseDelegate, report_failure};
use crate::error::{Result, SoapError, TransportError};
use crate::node::NodeTree;
use crate::pool::{EngineId, RunListener};
use crate::retry::{RetryDecision, RetryState};
use crate::stamp::ActionStamp;
use crate::tag_extractor::{ExtractingDecoder, Extraction};
use crate::transport::{Transport, TransportExchange};

/// Flags and counters observable from outside a run
///
/// Written only by the run's ingestion task (and `cancel`).
#[derive(Debug, Default)]
struct EngineStatus {
    in_loading: AtomicBool,
    parsing: AtomicBool,
    unit_recognized: AtomicUsize,
    unit_processed: AtomicUsize,
    attempts: AtomicU32,
}

impl EngineStatus {
    fn reset_counters(&self) {
        self.unit_recognized.store(0, Ordering::Release);
        self.unit_processed.store(0, Ordering::Release);
        self.parsing.store(false, Ordering::Release);
    }
}

/// Terminal bookkeeping shared by a run task and [`SoapEngine::cancel`]
struct RunControl {
    engine: EngineId,
    token: CancellationToken,
    finished: AtomicBool,
    status: Arc<EngineStatus>,
    listener: Option<Arc<dyn RunListener>>,
}

impl RunControl {
    /// Only the first call has any effect
    fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.status.in_loading.store(false, Ordering::Release);
        self.status.parsing.store(false, Ordering::Release);
        if let Some(listener) = &self.listener {
            listener.run_finished(self.engine);
        }
    }
}

/// Finishes the run however its task ends, panics included
struct FinishOnDrop(Arc<RunControl>);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Completion of a run task; any number of callers may await it
type RunTask = Shared<BoxFuture<'static, ()>>;

struct RunHandle {
    control: Arc<RunControl>,
    task: RunTask,
}

/// Delegate access that goes quiet once the run is cancelled
#[derive(Clone)]
struct Emitter {
    delegate: Arc<dyn ResponseDelegate>,
    token: CancellationToken,
}

impl Emitter {
    fn emit(&self, event: impl FnOnce(&dyn ResponseDelegate)) {
        if !self.token.is_cancelled() {
            event(self.delegate.as_ref());
        }
    }

    /// Returns true when a unit reached the delegate
    fn deliver(&self, extraction: Extraction) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        match extraction {
            Extraction::Unit(unit) => {
                self.delegate.unit_received(unit);
                true
            }
            Extraction::Content {
                text,
                tag,
                last_chunk,
            } => {
                self.delegate.content_received(&text, &tag, last_chunk);
                false
            }
            Extraction::OrderedTag { tag, unit } => {
                self.delegate.ordered_tag_received(&tag, unit);
                false
            }
        }
    }
}

/// Hands extraction events to the delegate in document order
enum Dispatcher {
    Inline(Emitter),
    Worker {
        queue: mpsc::UnboundedSender<Extraction>,
        delivered: mpsc::UnboundedReceiver<bool>,
        worker: JoinHandle<()>,
        outstanding: usize,
    },
}

impl Dispatcher {
    fn new(asynchronous: bool, emitter: &Emitter) -> Self {
        if !asynchronous {
            return Dispatcher::Inline(emitter.clone());
        }

        let (queue, mut inbox) = mpsc::unbounded_channel::<Extraction>();
        let (acks, delivered) = mpsc::unbounded_channel();
        let emitter = emitter.clone();
        let worker = tokio::spawn(async move {
            while let Some(extraction) = inbox.recv().await {
                // Undelivered events of a cancelled run are dropped
                if emitter.token.is_cancelled() {
                    break;
                }
                let unit = emitter.deliver(extraction);
                if acks.send(unit).is_err() {
                    break;
                }
            }
        });

        Dispatcher::Worker {
            queue,
            delivered,
            worker,
            outstanding: 0,
        }
    }

    fn dispatch(&mut self, events: Vec<Extraction>, status: &EngineStatus) {
        for event in events {
            if matches!(event, Extraction::Unit(_)) {
                status.unit_recognized.fetch_add(1, Ordering::AcqRel);
            }
            match self {
                Dispatcher::Inline(emitter) => {
                    if emitter.deliver(event) {
                        status.unit_processed.fetch_add(1, Ordering::AcqRel);
                    }
                }
                Dispatcher::Worker {
                    queue, outstanding, ..
                } => {
                    if queue.send(event).is_ok() {
                        *outstanding += 1;
                    }
                }
            }
        }
        self.collect_acks(status);
    }

    fn collect_acks(&mut self, status: &EngineStatus) {
        if let Dispatcher::Worker {
            delivered,
            outstanding,
            ..
        } = self
        {
            while let Ok(unit) = delivered.try_recv() {
                *outstanding = outstanding.saturating_sub(1);
                if unit {
                    status.unit_processed.fetch_add(1, Ordering::AcqRel);
                }
            }
            status.parsing.store(*outstanding > 0, Ordering::Release);
        }
    }

    /// Wait for every queued event to be delivered
    async fn close(self, status: &EngineStatus) -> Result<()> {
        let Dispatcher::Worker {
            queue,
            mut delivered,
            worker,
            ..
        } = self
        else {
            return Ok(());
        };

        drop(queue);
        let joined = worker.await;
        while let Ok(unit) = delivered.try_recv() {
            if unit {
                status.unit_processed.fetch_add(1, Ordering::AcqRel);
            }
        }
        status.parsing.store(false, Ordering::Release);
        joined.map_err(|e| SoapError::Worker {
            details: e.to_string(),
        })
    }
}

/// Why one connection attempt ended without a document
enum AttemptFailure {
    /// Connection-level; may be retried
    Transport(TransportError),
    /// Ends the run regardless of the attempt budget
    Fatal(SoapError),
}

/// State owned by one run's ingestion task
struct Run {
    engine: EngineId,
    stamp: Arc<ActionStamp>,
    transport: Arc<dyn Transport>,
    emitter: Emitter,
    status: Arc<EngineStatus>,
}

impl Run {
    async fn execute(self, control: Arc<RunControl>) {
        let _finish = FinishOnDrop(Arc::clone(&control));
        let token = control.token.clone();
        let mut retry = RetryState::new(self.stamp.retry_policy());

        info!(
            engine = %self.engine,
            action = self.stamp.soap_action(),
            url = %self.stamp.request().url,
            "run started"
        );

        let outcome = loop {
            retry.begin_attempt();
            let attempt = retry.attempts_made();
            self.status.attempts.store(attempt, Ordering::Release);
            debug!(engine = %self.engine, attempt, "connection attempt");

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!(engine = %self.engine, attempt, "run cancelled");
                    return;
                }
                result = self.attempt() => result,
            };

            match result {
                Ok(tree) => {
                    retry.succeed();
                    break Ok(tree);
                }
                Err(AttemptFailure::Transport(error)) if error.is_retryable() => {
                    match retry.on_failure() {
                        RetryDecision::Retry(delay) => {
                            warn!(
                                engine = %self.engine,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %error,
                                "attempt failed, retry scheduled"
                            );
                            tokio::select! {
                                biased;
                                _ = token.cancelled() => {
                                    info!(engine = %self.engine, "run cancelled while waiting to retry");
                                    return;
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        RetryDecision::Exhausted => {
                            break Err(SoapError::RetriesExhausted {
                                attempts: attempt,
                                source: error,
                            });
                        }
                    }
                }
                Err(AttemptFailure::Transport(error)) => break Err(SoapError::Transport(error)),
                Err(AttemptFailure::Fatal(error)) => break Err(error),
            }
        };

        match outcome {
            Ok(tree) => {
                info!(
                    engine = %self.engine,
                    attempts = retry.attempts_made(),
                    nodes = tree.node_count(),
                    units = self.status.unit_processed.load(Ordering::Acquire),
                    "run finished"
                );
                self.emitter.emit(|d| d.entire_response_received(tree));
                self.emitter.emit(|d| d.progress(0.0));
                self.emitter.emit(|d| d.finished_loading());
            }
            Err(error) => {
                warn!(engine = %self.engine, error = %error, "run failed");
                self.emitter.emit(|d| report_failure(d, &error));
            }
        }
    }

    /// Open the exchange, answering one authentication challenge
    async fn open(&self) -> std::result::Result<TransportExchange, AttemptFailure> {
        let request = self.stamp.request();
        match self.transport.exchange(request, None).await {
            Err(TransportError::AuthenticationChallenge { realm }) => {
                let Some(credential) = self.stamp.credential() else {
                    let realm = realm
                        .map(|realm| format!(" for realm '{}'", realm))
                        .unwrap_or_default();
                    return Err(AttemptFailure::Fatal(SoapError::Authentication {
                        message: format!("server requested credentials{} but none is configured", realm),
                    }));
                };

                debug!(engine = %self.engine, "answering authentication challenge");
                match self.transport.exchange(request, Some(credential)).await {
                    Err(TransportError::AuthenticationChallenge { .. }) => {
                        Err(AttemptFailure::Fatal(SoapError::Authentication {
                            message: format!("credential for '{}' was rejected", credential.username),
                        }))
                    }
                    other => other.map_err(AttemptFailure::Transport),
                }
            }
            other => other.map_err(AttemptFailure::Transport),
        }
    }

    async fn attempt(&self) -> std::result::Result<NodeTree, AttemptFailure> {
        let TransportExchange { metadata, mut body } = self.open().await?;

        // A retried attempt starts a fresh document
        self.status.reset_counters();
        self.emitter.emit(|d| d.response_started(&metadata));

        let mut decoder = ExtractingDecoder::new(self.stamp.tags());
        let mut dispatcher =
            Dispatcher::new(self.stamp.parse_units_asynchronously(), &self.emitter);
        let total = metadata.content_length.filter(|&length| length > 0);
        let mut received = 0u64;

        while let Some(fragment) = body.next().await {
            let fragment = match fragment {
                Ok(fragment) => fragment,
                Err(error) => {
                    return Err(self
                        .abandon(dispatcher, AttemptFailure::Transport(error))
                        .await);
                }
            };

            received += fragment.len() as u64;
            trace!(engine = %self.engine, bytes = fragment.len(), received, "fragment");
            if let Some(total) = total {
                let fraction = (received as f64 / total as f64).clamp(f64::MIN_POSITIVE, 1.0);
                self.emitter.emit(|d| d.progress(fraction));
            }

            match decoder.feed(&fragment) {
                Ok(events) => dispatcher.dispatch(events, &self.status),
                Err(error) => {
                    dispatcher.dispatch(decoder.drain(), &self.status);
                    return Err(self.abandon(dispatcher, AttemptFailure::Fatal(error)).await);
                }
            }
        }

        match decoder.finish() {
            Ok((tree, events)) => {
                dispatcher.dispatch(events, &self.status);
                dispatcher
                    .close(&self.status)
                    .await
                    .map_err(AttemptFailure::Fatal)?;
                Ok(tree)
            }
            Err(error) => {
                dispatcher.dispatch(decoder.drain(), &self.status);
                Err(self.abandon(dispatcher, AttemptFailure::Fatal(error)).await)
            }
        }
    }

    /// Let already queued events drain, then report the failure
    ///
    /// A worker failure takes precedence over the original one.
    async fn abandon(&self, dispatcher: Dispatcher, failure: AttemptFailure) -> AttemptFailure {
        match dispatcher.close(&self.status).await {
            Ok(()) => failure,
            Err(worker) => AttemptFailure::Fatal(worker),
        }
    }
}

/// Drives runs of SOAP actions against one transport
///
/// Runs are spawned on the current Tokio runtime, so [`SoapEngine::load`] must
/// be called from within one. Dropping the engine cancels its run.
pub struct SoapEngine {
    id: EngineId,
    transport: Arc<dyn Transport>,
    delegate: Arc<dyn ResponseDelegate>,
    listener: Option<Arc<dyn RunListener>>,
    status: Arc<EngineStatus>,
    current: Mutex<Option<RunHandle>>,
    last_stamp: Mutex<Option<Arc<ActionStamp>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SoapEngine {
    pub fn new(transport: Arc<dyn Transport>, delegate: Arc<dyn ResponseDelegate>) -> Self {
        Self {
            id: EngineId::new(),
            transport,
            delegate,
            listener: None,
            status: Arc::new(EngineStatus::default()),
            current: Mutex::new(None),
            last_stamp: Mutex::new(None),
        }
    }

    /// Report run start/finish to `listener`
    pub fn with_listener(mut self, listener: Arc<dyn RunListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn id(&self) -> EngineId {
        self.id
    }

    /// Start a run of `action`
    ///
    /// The request and configuration are frozen now; later edits to `action`
    /// do not affect this run or its retries.
    pub fn load(&self, action: &SoapAction) -> Result<()> {
        let stamp = Arc::new(action.stamp()?);
        self.start(stamp)
    }

    /// Run the last loaded stamp again with a fresh attempt budget
    pub fn reload(&self) -> Result<()> {
        let stamp = lock(&self.last_stamp)
            .clone()
            .ok_or_else(|| SoapError::InvalidRequest {
                details: "nothing has been loaded on this engine yet".to_string(),
            })?;
        self.start(stamp)
    }

    fn start(&self, stamp: Arc<ActionStamp>) -> Result<()> {
        let mut current = lock(&self.current);
        if self.status.in_loading.load(Ordering::Acquire) {
            return Err(SoapError::RunInProgress);
        }

        self.status.in_loading.store(true, Ordering::Release);
        self.status.reset_counters();
        self.status.attempts.store(0, Ordering::Release);

        let token = CancellationToken::new();
        let listener = if stamp.network_activity_indicator() {
            self.listener.clone()
        } else {
            None
        };
        let control = Arc::new(RunControl {
            engine: self.id,
            token: token.clone(),
            finished: AtomicBool::new(false),
            status: Arc::clone(&self.status),
            listener,
        });
        if let Some(listener) = &control.listener {
            listener.run_started(self.id);
        }

        let run = Run {
            engine: self.id,
            stamp: Arc::clone(&stamp),
            transport: Arc::clone(&self.transport),
            emitter: Emitter {
                delegate: Arc::clone(&self.delegate),
                token,
            },
            status: Arc::clone(&self.status),
        };
        let engine = self.id;
        let task = tokio::spawn(run.execute(Arc::clone(&control)))
            .map(move |result| {
                if let Err(error) = result {
                    warn!(engine = %engine, error = %error, "run task ended abnormally");
                }
            })
            .boxed()
            .shared();

        *current = Some(RunHandle { control, task });
        *lock(&self.last_stamp) = Some(stamp);
        Ok(())
    }

    /// Stop the current run
    ///
    /// The engine is not in loading once this returns. No further callback of
    /// the run starts and a pending retry never starts.
    ///
    /// The check and the callback are not atomic. A callback that already
    /// passed the cancellation check, on the run task or the extraction
    /// worker, may still be running on another thread when this returns and
    /// runs to completion. A delegate shared with other work must tolerate
    /// that one late callback.
    pub fn cancel(&self) {
        let current = lock(&self.current);
        if let Some(handle) = current.as_ref() {
            if !handle.control.finished.load(Ordering::Acquire) {
                info!(engine = %self.id, "cancelling run");
            }
            handle.control.token.cancel();
            handle.control.finish();
        }
    }

    /// Wait until the current run's task has ended
    ///
    /// Safe to call again, or from several places at once.
    pub async fn wait(&self) {
        let task = lock(&self.current)
            .as_ref()
            .map(|handle| handle.task.clone());
        if let Some(task) = task {
            task.await;
        }
    }

    pub fn is_in_loading(&self) -> bool {
        self.status.in_loading.load(Ordering::Acquire)
    }

    /// Whether extraction work handed to the worker is still outstanding
    pub fn is_parsing(&self) -> bool {
        self.status.parsing.load(Ordering::Acquire)
    }

    pub fn unit_recognized(&self) -> usize {
        self.status.unit_recognized.load(Ordering::Acquire)
    }

    pub fn unit_processed(&self) -> usize {
        self.status.unit_processed.load(Ordering::Acquire)
    }

    /// Connection attempts made by the current or last run
    pub fn attempts(&self) -> u32 {
        self.status.attempts.load(Ordering::Acquire)
    }

    pub fn stamp(&self) -> Option<Arc<ActionStamp>> {
        lock(&self.last_stamp).clone()
    }

    /// Request reissued by retries of the current or last run
    pub fn fixed_request(&self) -> Option<SoapRequest> {
        self.stamp().map(|stamp| stamp.request().clone())
    }
}

impl Drop for SoapEngine {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for SoapEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoapEngine")
            .field("id", &self.id)
            .field("in_loading", &self.is_in_loading())
            .field("parsing", &self.is_parsing())
            .field("unit_recognized", &self.unit_recognized())
            .field("unit_processed", &self.unit_processed())
            .finish()
    }
}
