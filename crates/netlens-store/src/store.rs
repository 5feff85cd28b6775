use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use netlens_core::record::{ErrorData, RequestRecord, ResponseData, TimingData};
use netlens_core::{RequestId, TraceId};

use crate::filter::RequestFilter;

/// Sizing limits for the capture buffer.
#[derive(Clone, Copy, Debug)]
pub struct StoreConfig {
    /// Maximum number of live records; the oldest is evicted on overflow.
    pub capacity: usize,
    /// Byte cap applied to every stored request/response body.
    pub max_body_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            max_body_size: 256 * 1024,
        }
    }
}

/// Bounded, indexed store of captured requests.
///
/// Insertion order lives in an explicit FIFO of ids so eviction stays
/// deterministic regardless of map iteration order. All operations are
/// synchronous, never block on I/O, and are safe to call from any thread.
pub struct RequestStore {
    config: StoreConfig,
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    records: HashMap<RequestId, RequestRecord>,
    order: VecDeque<RequestId>,
    by_trace: HashMap<TraceId, Vec<RequestId>>,
}

impl RequestStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    pub fn config(&self) -> StoreConfig {
        self.config
    }

    /// Insert a record, capping its body and evicting the oldest entry when
    /// at capacity. Re-adding an existing id replaces the record in place
    /// without disturbing its FIFO position.
    pub fn add(&self, mut record: RequestRecord) {
        if self.config.capacity == 0 {
            return;
        }
        record.cap_body(self.config.max_body_size);

        let mut inner = self.inner.lock();
        if inner.records.contains_key(&record.id) {
            inner.records.insert(record.id.clone(), record);
            return;
        }
        while inner.order.len() >= self.config.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                evict(&mut inner, &oldest);
            }
        }
        if let Some(trace_id) = record.trace_id.clone() {
            inner.by_trace.entry(trace_id).or_default().push(record.id.clone());
        }
        inner.order.push_back(record.id.clone());
        inner.records.insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &RequestId) -> Option<RequestRecord> {
        self.inner.lock().records.get(id).cloned()
    }

    /// Every record captured under `trace_id`, in insertion order.
    pub fn get_by_trace_id(&self, trace_id: &TraceId) -> Vec<RequestRecord> {
        let inner = self.inner.lock();
        inner
            .by_trace
            .get(trace_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.records.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Live records matching `filter`, in insertion order.
    pub fn query(&self, filter: &RequestFilter) -> Vec<RequestRecord> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.records.get(id))
            .filter(|record| filter.matches(record))
            .cloned()
            .collect()
    }

    /// All live records, newest first.
    pub fn get_all(&self) -> Vec<RequestRecord> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.records.get(id).cloned())
            .collect()
    }

    /// Attach a response. Silent no-op if `id` is unknown (the producer may
    /// race with eviction or `clear`) or the record already failed — a
    /// record never holds both a response and an error.
    pub fn update_response(&self, id: &RequestId, mut response: ResponseData) {
        response.cap_body(self.config.max_body_size);
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.get_mut(id) {
            if record.error.is_some() {
                return;
            }
            record.response = Some(response);
        }
    }

    /// Attach an error. Same no-op contract as [`Self::update_response`].
    pub fn update_error(&self, id: &RequestId, error: ErrorData) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.get_mut(id) {
            if record.response.is_some() {
                return;
            }
            record.error = Some(error);
        }
    }

    /// Attach timing data. Silent no-op if `id` is unknown.
    pub fn update_timing(&self, id: &RequestId, timing: TimingData) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.get_mut(id) {
            record.timing = Some(timing);
        }
    }

    /// Drop every record and reset all indices.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.records.clear();
        inner.order.clear();
        inner.by_trace.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn evict(inner: &mut StoreInner, id: &RequestId) {
    if let Some(record) = inner.records.remove(id) {
        if let Some(trace_id) = &record.trace_id {
            if let Some(ids) = inner.by_trace.get_mut(trace_id) {
                ids.retain(|i| i != id);
                if ids.is_empty() {
                    inner.by_trace.remove(trace_id);
                }
            }
        }
        tracing::debug!(id = %record.id, "evicted oldest request");
    }
}
