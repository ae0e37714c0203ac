//! Batched event fan-out to observer clients
//!
//! Captured records coalesce into a request batch and a response batch.
//! A flush happens when either batch reaches [`BATCH_SIZE`], when the
//! interval timer armed by the first buffered record fires, or explicitly
//! on proxy stop. Every flush emits at most one event per batch kind to
//! each observer; observers that stop draining lose events instead of
//! blocking the capture pipeline.

use crate::models::{ProxyEvent, RequestDetails};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Records per batch before an immediate flush
pub const BATCH_SIZE: usize = 50;
/// Flush interval once a batch holds at least one record
pub const BATCH_INTERVAL: Duration = Duration::from_millis(100);
/// Bounded depth of each observer channel
pub const OBSERVER_BUFFER: usize = 100;

struct Batches {
  requests: Vec<RequestDetails>,
  responses: Vec<RequestDetails>,
  timer: Option<JoinHandle<()>>,
}

struct Observer {
  id: u64,
  tx: mpsc::Sender<ProxyEvent>,
  congested: bool,
}

/// Coalescing broadcast hub between the capture pipeline and observers
pub struct EventBus {
  batches: Mutex<Batches>,
  observers: Mutex<Vec<Observer>>,
  next_observer_id: AtomicU64,
  batch_size: usize,
  interval: Duration,
  // handed to the flush timer and to observer guards
  weak: Weak<EventBus>,
}

/// Releases an observer subscription when dropped
pub struct ObserverGuard {
  id: u64,
  bus: Weak<EventBus>,
}

impl ObserverGuard {
  pub fn id(&self) -> u64 {
    self.id
  }
}

impl Drop for ObserverGuard {
  fn drop(&mut self) {
    if let Some(bus) = self.bus.upgrade() {
      bus.unsubscribe(self.id);
    }
  }
}

impl EventBus {
  pub fn new() -> Arc<Self> {
    Self::with_config(BATCH_SIZE, BATCH_INTERVAL)
  }

  pub fn with_config(batch_size: usize, interval: Duration) -> Arc<Self> {
    Arc::new_cyclic(|weak| Self {
      batches: Mutex::new(Batches {
        requests: Vec::new(),
        responses: Vec::new(),
        timer: None,
      }),
      observers: Mutex::new(Vec::new()),
      next_observer_id: AtomicU64::new(1),
      batch_size,
      interval,
      weak: weak.clone(),
    })
  }

  /// Queue a request-side record
  pub fn push_request(&self, record: RequestDetails) {
    self.push(record, true);
  }

  /// Queue a response-side record
  pub fn push_response(&self, record: RequestDetails) {
    self.push(record, false);
  }

  fn push(&self, record: RequestDetails, is_request: bool) {
    let flush_now = {
      let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
      if is_request {
        batches.requests.push(record);
      } else {
        batches.responses.push(record);
      }
      let flush_now =
        batches.requests.len() >= self.batch_size || batches.responses.len() >= self.batch_size;

      if !flush_now && batches.timer.is_none() {
        let bus = self.weak.clone();
        let interval = self.interval;
        batches.timer = Some(tokio::spawn(async move {
          tokio::time::sleep(interval).await;
          if let Some(bus) = bus.upgrade() {
            bus.flush();
          }
        }));
      }
      flush_now
    };

    if flush_now {
      self.flush();
    }
  }

  /// Drain both batches and broadcast them, requests first.
  /// Called by the size trigger, the timer, and proxy stop.
  pub fn flush(&self) {
    let (requests, responses) = {
      let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
      if let Some(timer) = batches.timer.take() {
        timer.abort();
      }
      (
        std::mem::take(&mut batches.requests),
        std::mem::take(&mut batches.responses),
      )
    };

    if !requests.is_empty() {
      self.broadcast(ProxyEvent::request_batch(requests));
    }
    if !responses.is_empty() {
      self.broadcast(ProxyEvent::response_batch(responses));
    }
  }

  fn broadcast(&self, event: ProxyEvent) {
    let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
    observers.retain_mut(|observer| match observer.tx.try_send(event.clone()) {
      Ok(()) => {
        observer.congested = false;
        true
      }
      Err(mpsc::error::TrySendError::Full(_)) => {
        if !observer.congested {
          observer.congested = true;
          tracing::warn!(observer = observer.id, "observer channel full, dropping events");
        }
        true
      }
      Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
  }

  /// Register an observer; the guard releases the slot on drop
  pub fn subscribe(&self) -> (ObserverGuard, mpsc::Receiver<ProxyEvent>) {
    let (tx, rx) = mpsc::channel(OBSERVER_BUFFER);
    let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
    self
      .observers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(Observer {
        id,
        tx,
        congested: false,
      });
    (
      ObserverGuard {
        id,
        bus: self.weak.clone(),
      },
      rx,
    )
  }

  pub fn unsubscribe(&self, id: u64) {
    self
      .observers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .retain(|observer| observer.id != id);
  }

  pub fn observer_count(&self) -> usize {
    self
      .observers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }
}
