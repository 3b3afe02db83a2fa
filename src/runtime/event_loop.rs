//! Bounded-queue event processor with a fixed worker pool.
//!
//! An `Eventloop<T>` admits events through [`Eventloop::send`] into a bounded
//! queue and hands them to `workers` concurrent tasks, each of which awaits the
//! handler for one event at a time. Within one worker events are handled in
//! queue order; with more than one worker there is no cross-event ordering.
//!
//! ## Shutdown
//!
//! - Graceful ([`Eventloop::close`]): admission stops at once, everything
//!   already admitted is still handled, then the workers exit.
//! - Forced ([`Eventloop::force_close`]): admission stops and workers exit
//!   after the event they are currently handling. Queued events are dropped.
//!
//! A force close issued while a graceful close is draining takes over and
//! stops the drain. Once the state leaves `Open` it never returns.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{error, trace, warn};

/// Returned by [`Eventloop::send`] once shutdown has begun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("event loop already closed")]
pub struct AlreadyClosed;

/// Shutdown mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Drain admitted events before stopping.
    Graceful,
    /// Stop without draining.
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Closing,
    ForceClosed,
}

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type EventHandler<T> = Arc<dyn Fn(T) -> BoxFuture + Send + Sync>;

/// Bounded worker-pool event processor.
pub struct Eventloop<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    /// Admission side; `None` once shutdown has begun.
    tx: RwLock<Option<mpsc::Sender<T>>>,
    rx: Mutex<mpsc::Receiver<T>>,
    handler: EventHandler<T>,
    workers: usize,
    /// Admitted events not yet taken by a worker.
    pending: AtomicUsize,
    state: watch::Sender<State>,
    running: AtomicBool,
    done: watch::Sender<bool>,
}

impl<T: Send + 'static> Eventloop<T> {
    /// Create an unstarted loop.
    ///
    /// `capacity` bounds the queue and `workers` is the number of concurrent
    /// handler invocations; both are raised to at least 1.
    pub fn new<F, Fut>(capacity: usize, workers: usize, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handler: EventHandler<T> =
            Arc::new(move |event: T| -> BoxFuture { Box::pin(handler(event)) });

        Self {
            inner: Arc::new(Inner {
                tx: RwLock::new(Some(tx)),
                rx: Mutex::new(rx),
                handler,
                workers: workers.max(1),
                pending: AtomicUsize::new(0),
                state: watch::channel(State::Open).0,
                running: AtomicBool::new(false),
                done: watch::channel(false).0,
            }),
        }
    }

    /// Run the workers until shutdown completes.
    ///
    /// Returns only after every worker task has exited. Calling `run` a second
    /// time returns immediately.
    pub async fn run(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            warn!("Event loop is already running");
            return;
        }

        let mut workers = JoinSet::new();
        for id in 0..self.inner.workers {
            let inner = Arc::clone(&self.inner);
            workers.spawn(async move { inner.work(id).await });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Event loop worker failed");
            }
        }

        trace!(
            discarded = self.inner.pending.load(Ordering::Acquire),
            "Event loop stopped"
        );
        self.inner.done.send_replace(true);
    }

    /// Enqueue `event`, waiting while the queue is full.
    ///
    /// Fails with [`AlreadyClosed`] if shutdown has begun, including when it
    /// begins while this call is waiting for room.
    pub async fn send(&self, event: T) -> Result<(), AlreadyClosed> {
        let tx = self.inner.sender().ok_or(AlreadyClosed)?;
        let mut state = self.inner.state.subscribe();

        tokio::select! {
            biased;
            _ = state.wait_for(|s| *s != State::Open) => Err(AlreadyClosed),
            permit = tx.reserve() => {
                let permit = permit.map_err(|_| AlreadyClosed)?;
                // Count before the final state check so a concurrent `closed`
                // either sees this event or sees the send fail.
                self.inner.pending.fetch_add(1, Ordering::SeqCst);
                if *self.inner.state.borrow() != State::Open {
                    self.inner.pending.fetch_sub(1, Ordering::SeqCst);
                    return Err(AlreadyClosed);
                }
                permit.send(event);
                Ok(())
            }
        }
    }

    /// Begin shutdown without waiting for it to finish.
    ///
    /// Returns `false` if the call had no effect (already in that mode or a
    /// stronger one).
    pub fn shutdown(&self, mode: Shutdown) -> bool {
        let next = match mode {
            Shutdown::Graceful => State::Closing,
            Shutdown::Force => State::ForceClosed,
        };

        let changed = self.inner.state.send_if_modified(|state| {
            let advance = matches!(
                (*state, next),
                (State::Open, _) | (State::Closing, State::ForceClosed)
            );
            if advance {
                *state = next;
            }
            advance
        });

        // Dropping the stored sender lets the receiver report end-of-queue
        // once in-flight sends finish and the queue drains.
        self.inner
            .tx
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if changed {
            trace!(mode = ?mode, "Event loop shutting down");
        }
        changed
    }

    /// Graceful shutdown: stop admission, handle every admitted event, then
    /// wait for `run` to return.
    pub async fn close(&self) {
        self.shutdown(Shutdown::Graceful);
        self.closed().await;
    }

    /// Forced shutdown: stop admission and workers without draining, then
    /// wait for `run` to return.
    pub async fn force_close(&self) {
        self.shutdown(Shutdown::Force);
        self.closed().await;
    }

    /// Wait for `run` to return.
    ///
    /// Admitted events keep this waiting even if `run` has not been polled
    /// yet, so a graceful close never returns ahead of the drain. Returns at
    /// once only when `run` never started and there is nothing left to
    /// handle: the queue is empty or a force close discarded it.
    pub async fn closed(&self) {
        let mut done = self.inner.done.subscribe();
        if !self.inner.running.load(Ordering::Acquire) {
            let discarded = *self.inner.state.borrow() == State::ForceClosed;
            if self.inner.pending.load(Ordering::SeqCst) == 0 || discarded {
                return;
            }
        }
        let _ = done.wait_for(|done| *done).await;
    }

    /// Whether shutdown has begun.
    pub fn is_closed(&self) -> bool {
        *self.inner.state.borrow() != State::Open
    }

    /// Events admitted but not yet taken by a worker.
    pub fn len(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Check if no admitted events are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn shared_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl<T: Send + 'static> Inner<T> {
    fn sender(&self) -> Option<mpsc::Sender<T>> {
        self.tx
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn work(&self, worker: usize) {
        let mut state = self.state.subscribe();

        loop {
            let event = {
                let mut rx = self.rx.lock().await;
                tokio::select! {
                    biased;
                    _ = state.wait_for(|s| *s == State::ForceClosed) => None,
                    event = rx.recv() => event,
                }
            };

            let Some(event) = event else {
                break;
            };
            self.pending.fetch_sub(1, Ordering::AcqRel);
            (self.handler)(event).await;
        }

        trace!(worker, "Event loop worker exited");
    }
}
