//! Bounded in-memory store for captured exchanges
//!
//! A fixed-capacity circular buffer keyed by record id. Appends evict the
//! oldest record once full; response arrival overwrites the matching record
//! in place. Snapshots are copies in newest-first order.

use crate::models::RequestDetails;
use std::sync::{PoisonError, RwLock};

/// Default store capacity
pub const MAX_CACHED_REQUESTS: usize = 1000;

struct Ring {
  slots: Vec<Option<RequestDetails>>,
  head: usize,
  tail: usize,
  count: usize,
}

/// Thread-safe circular buffer of the most recent captured exchanges
pub struct RequestStore {
  inner: RwLock<Ring>,
  capacity: usize,
}

impl RequestStore {
  pub fn new() -> Self {
    Self::with_capacity(MAX_CACHED_REQUESTS)
  }

  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      inner: RwLock::new(Ring {
        slots: (0..capacity).map(|_| None).collect(),
        head: 0,
        tail: 0,
        count: 0,
      }),
      capacity,
    }
  }

  /// Append a record, evicting the oldest one when full
  pub fn append(&self, record: RequestDetails) {
    let mut ring = self.inner.write().unwrap_or_else(PoisonError::into_inner);
    let tail = ring.tail;
    ring.slots[tail] = Some(record);
    ring.tail = (ring.tail + 1) % self.capacity;
    if ring.count < self.capacity {
      ring.count += 1;
    } else {
      ring.head = (ring.head + 1) % self.capacity;
    }
  }

  /// Overwrite the record with the same id; no-op when the id was
  /// scope-dropped or already evicted
  pub fn update_by_id(&self, record: RequestDetails) {
    let mut ring = self.inner.write().unwrap_or_else(PoisonError::into_inner);
    let mut found = None;
    for i in 0..ring.count {
      let idx = (ring.head + i) % self.capacity;
      if ring.slots[idx].as_ref().map(|r| r.id) == Some(record.id) {
        found = Some(idx);
        break;
      }
    }
    if let Some(idx) = found {
      ring.slots[idx] = Some(record);
    }
  }

  /// All live records, newest first
  pub fn snapshot(&self) -> Vec<RequestDetails> {
    let ring = self.inner.read().unwrap_or_else(PoisonError::into_inner);
    let mut result = Vec::with_capacity(ring.count);
    for i in (0..ring.count).rev() {
      let idx = (ring.head + i) % self.capacity;
      if let Some(record) = &ring.slots[idx] {
        result.push(record.clone());
      }
    }
    result
  }

  pub fn clear(&self) {
    let mut ring = self.inner.write().unwrap_or_else(PoisonError::into_inner);
    ring.head = 0;
    ring.tail = 0;
    ring.count = 0;
  }

  pub fn len(&self) -> usize {
    self
      .inner
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .count
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Default for RequestStore {
  fn default() -> Self {
    Self::new()
  }
}
