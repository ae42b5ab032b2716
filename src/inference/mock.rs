//! Mock inference client for testing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{
    BatchPoll, BatchRequest, InferenceClient, ItemOutcome, ItemResult, PollStatus, SharedContext,
};
use crate::domain::{BatchId, ItemKey, SourceId};
use crate::error::{Result, VolleyError};

/// Mock batch backend.
///
/// Batch ids are deterministic (`batch_1`, `batch_2`, ...) so tests can queue poll
/// responses before the daemon submits. A batch with no queued response reports
/// in-progress, unless the client was built with [`MockInferenceClient::auto_completing`].
///
/// # Example
/// ```ignore
/// let mock = MockInferenceClient::new();
/// mock.complete_all_succeeded(&BatchId::from("batch_1"));
/// ```
#[derive(Clone)]
pub struct MockInferenceClient {
    next_id: Arc<AtomicUsize>,
    submissions: Arc<Mutex<Vec<MockSubmission>>>,
    submit_failures: Arc<Mutex<VecDeque<String>>>,
    poll_responses: Arc<Mutex<HashMap<BatchId, VecDeque<MockPoll>>>>,
    /// Batches for which no terminal poll response has been returned yet.
    outstanding: Arc<Mutex<HashSet<BatchId>>>,
    max_outstanding: Arc<AtomicUsize>,
    poll_count: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    auto_complete: bool,
}

/// A queued poll response that can optionally wait for a trigger before completing.
enum MockPoll {
    Immediate(Result<BatchPoll>),
    Triggered {
        response: Result<BatchPoll>,
        trigger: oneshot::Receiver<()>,
    },
}

/// Record of one `submit` call.
#[derive(Debug, Clone)]
pub struct MockSubmission {
    pub batch_id: BatchId,
    pub source_id: SourceId,
    pub item_keys: Vec<ItemKey>,
    pub correlation_keys: Vec<String>,
    pub context: Vec<SharedContext>,
}

impl MockInferenceClient {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicUsize::new(1)),
            submissions: Arc::new(Mutex::new(Vec::new())),
            submit_failures: Arc::new(Mutex::new(VecDeque::new())),
            poll_responses: Arc::new(Mutex::new(HashMap::new())),
            outstanding: Arc::new(Mutex::new(HashSet::new())),
            max_outstanding: Arc::new(AtomicUsize::new(0)),
            poll_count: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            auto_complete: false,
        }
    }

    /// A mock whose batches succeed on their first poll, echoing each correlation key.
    pub fn auto_completing() -> Self {
        Self {
            auto_complete: true,
            ..Self::new()
        }
    }

    /// Make the next `submit` call fail with a submission error.
    pub fn fail_next_submit(&self, message: &str) {
        self.submit_failures.lock().push_back(message.to_string());
    }

    /// Queue a poll response for a batch. Responses are returned in FIFO order.
    pub fn add_poll_response(&self, batch_id: &BatchId, response: Result<BatchPoll>) {
        self.poll_responses
            .lock()
            .entry(batch_id.clone())
            .or_default()
            .push_back(MockPoll::Immediate(response));
    }

    /// Queue a poll response that blocks until the returned sender fires (or is dropped).
    pub fn add_poll_response_with_trigger(
        &self,
        batch_id: &BatchId,
        response: Result<BatchPoll>,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.poll_responses
            .lock()
            .entry(batch_id.clone())
            .or_default()
            .push_back(MockPoll::Triggered {
                response,
                trigger: rx,
            });
        tx
    }

    /// Queue an ended response in which every item of the (already submitted) batch succeeds.
    pub fn complete_all_succeeded(&self, batch_id: &BatchId) {
        let results = self
            .submission(batch_id)
            .map(|s| succeeded_results(&s.correlation_keys))
            .unwrap_or_default();
        self.add_poll_response(batch_id, Ok(BatchPoll::ended(results)));
    }

    pub fn submissions(&self) -> Vec<MockSubmission> {
        self.submissions.lock().clone()
    }

    pub fn submission(&self, batch_id: &BatchId) -> Option<MockSubmission> {
        self.submissions
            .lock()
            .iter()
            .find(|s| &s.batch_id == batch_id)
            .cloned()
    }

    pub fn submit_count(&self) -> usize {
        self.submissions.lock().len()
    }

    pub fn poll_count(&self) -> usize {
        self.poll_count.load(Ordering::SeqCst)
    }

    /// Number of poll calls currently executing.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Batches accepted and not yet reported terminal by this mock.
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().len()
    }

    /// Highest number of simultaneously outstanding batches observed.
    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding.load(Ordering::SeqCst)
    }
}

impl Default for MockInferenceClient {
    fn default() -> Self {
        Self::new()
    }
}

fn succeeded_results(correlation_keys: &[String]) -> Vec<ItemResult> {
    correlation_keys
        .iter()
        .map(|key| ItemResult {
            correlation_key: key.clone(),
            outcome: ItemOutcome::Output(format!("output for {key}")),
        })
        .collect()
}

#[async_trait]
impl InferenceClient for MockInferenceClient {
    async fn submit(&self, request: BatchRequest<'_>) -> Result<BatchId> {
        if let Some(message) = self.submit_failures.lock().pop_front() {
            return Err(VolleyError::Submission(message));
        }

        let batch_id = BatchId(format!(
            "batch_{}",
            self.next_id.fetch_add(1, Ordering::SeqCst)
        ));
        self.submissions.lock().push(MockSubmission {
            batch_id: batch_id.clone(),
            source_id: request.unit.source_id().clone(),
            item_keys: request.unit.keys(),
            correlation_keys: request.unit.entries().map(|(k, _)| k.to_string()).collect(),
            context: request.context.to_vec(),
        });

        let mut outstanding = self.outstanding.lock();
        outstanding.insert(batch_id.clone());
        self.max_outstanding
            .fetch_max(outstanding.len(), Ordering::SeqCst);
        Ok(batch_id)
    }

    async fn poll(&self, batch_id: &BatchId) -> Result<BatchPoll> {
        self.poll_count.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        let queued = self
            .poll_responses
            .lock()
            .get_mut(batch_id)
            .and_then(VecDeque::pop_front);

        let response = match queued {
            Some(MockPoll::Immediate(response)) => response,
            Some(MockPoll::Triggered { response, trigger }) => {
                // Proceed whether the trigger fired or was dropped.
                let _ = trigger.await;
                response
            }
            None if self.auto_complete => {
                let keys = self
                    .submission(batch_id)
                    .map(|s| s.correlation_keys)
                    .ok_or_else(|| VolleyError::BatchNotFound(batch_id.clone()))?;
                Ok(BatchPoll::ended(succeeded_results(&keys)))
            }
            None => Ok(BatchPoll::in_progress()),
        };

        if let Ok(poll) = &response
            && poll.status != PollStatus::InProgress
        {
            self.outstanding.lock().remove(batch_id);
        }
        response
    }
}
