//! State transitions for batches using the typestate pattern.
//!
//! ```text
//! SubmissionUnit ──submit──> Batch<Submitted> ──start_polling()──> Batch<Polling>
//!                                                                      │
//!                                         observe(InProgress) ─────────┤ (stays Polling)
//!                                         observe(Ended) ──────────────┼──> Batch<Completed>
//!                                         observe(Failed) ─────────────┼──> Batch<Failed>
//!                                         age > max_batch_age ─────────┴──> Batch<Expired>
//! ```
//!
//! Transitions are pure: they never touch the backend or the source. The lifecycle
//! manager performs the I/O around them.

use chrono::{DateTime, Duration, Utc};
use metrics::counter;

use super::state::{
    Batch, BatchData, BatchId, Completed, Expired, Failed, PollOutcome, Polling, Submitted,
};
use crate::domain::item::ItemStatus;
use crate::domain::unit::SubmissionUnit;
use crate::inference::{BatchPoll, PollStatus};

impl Batch<Submitted> {
    /// Record a unit the backend accepted under `batch_id`.
    pub fn new(batch_id: BatchId, mut unit: SubmissionUnit, submitted_at: DateTime<Utc>) -> Self {
        unit.set_status(ItemStatus::Submitted);
        Batch {
            data: BatchData {
                batch_id,
                unit,
                submitted_at,
            },
            state: Submitted {},
        }
    }

    /// Start tracking the batch. Happens as soon as it joins the active set.
    pub fn start_polling(self) -> Batch<Polling> {
        Batch {
            data: self.data,
            state: Polling {
                last_polled_at: None,
                polls: 0,
            },
        }
    }
}

impl Batch<Polling> {
    /// Time elapsed since the backend accepted the batch.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now - self.data.submitted_at
    }

    /// Whether a poll is due at `now` given the configured poll interval.
    pub fn is_due(&self, now: DateTime<Utc>, poll_interval: Duration) -> bool {
        match self.state.last_polled_at {
            None => true,
            Some(last) => now - last >= poll_interval,
        }
    }

    /// Apply one poll response.
    ///
    /// A reported completion wins over the age limit; an in-progress report past
    /// `max_age` expires the batch.
    pub fn observe(self, poll: BatchPoll, now: DateTime<Utc>, max_age: Duration) -> PollOutcome {
        match poll.status {
            PollStatus::Ended => {
                counter!("volley_batches_total", "outcome" => "completed").increment(1);
                PollOutcome::Completed(Batch {
                    data: self.data,
                    state: Completed {
                        completed_at: now,
                        results: poll.results.unwrap_or_default(),
                    },
                })
            }
            PollStatus::Failed { reason } => {
                counter!("volley_batches_total", "outcome" => "failed").increment(1);
                PollOutcome::Failed(Batch {
                    data: self.data,
                    state: Failed {
                        failed_at: now,
                        reason,
                    },
                })
            }
            PollStatus::InProgress => self.still_running(now, max_age),
        }
    }

    /// Apply a poll call that itself failed (network error, backend hiccup).
    ///
    /// The batch keeps polling; only the age limit can end it.
    pub fn poll_errored(self, now: DateTime<Utc>, max_age: Duration) -> PollOutcome {
        let age = self.age_at(now);
        if age > max_age {
            return self.expire(now, age);
        }
        PollOutcome::InProgress(Batch {
            data: self.data,
            state: Polling {
                last_polled_at: Some(now),
                polls: self.state.polls,
            },
        })
    }

    fn still_running(self, now: DateTime<Utc>, max_age: Duration) -> PollOutcome {
        let age = self.age_at(now);
        if age > max_age {
            return self.expire(now, age);
        }
        PollOutcome::InProgress(Batch {
            data: self.data,
            state: Polling {
                last_polled_at: Some(now),
                polls: self.state.polls + 1,
            },
        })
    }

    fn expire(self, now: DateTime<Utc>, age: Duration) -> PollOutcome {
        counter!("volley_batches_total", "outcome" => "expired").increment(1);
        PollOutcome::Expired(Batch {
            data: self.data,
            state: Expired {
                expired_at: now,
                age_secs: age.num_seconds(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::item::Item;
    use crate::domain::source::SourceId;
    use crate::inference::{ItemOutcome, ItemResult};

    fn polling_batch(submitted_at: DateTime<Utc>) -> Batch<Polling> {
        let unit = SubmissionUnit::new(
            SourceId::from("sheet-a"),
            vec![Item::pending("sheet-a", "2", Some("YES"))],
            submitted_at,
        );
        Batch::<Submitted>::new(BatchId::from("msgbatch_1"), unit, submitted_at).start_polling()
    }

    #[test]
    fn test_submitted_marks_items_submitted() {
        let batch = polling_batch(Utc::now());
        assert_eq!(batch.data.unit.items()[0].status, ItemStatus::Submitted);
        assert!(batch.state.last_polled_at.is_none());
    }

    #[test]
    fn test_in_progress_stays_polling() {
        let start = Utc::now();
        let batch = polling_batch(start);
        let outcome = batch.observe(BatchPoll::in_progress(), start, Duration::hours(1));
        match outcome {
            PollOutcome::InProgress(b) => {
                assert_eq!(b.state.polls, 1);
                assert_eq!(b.state.last_polled_at, Some(start));
            }
            other => panic!("Expected InProgress, got {:?}", other),
        }
    }

    #[test]
    fn test_ended_completes_with_results() {
        let start = Utc::now();
        let results = vec![ItemResult {
            correlation_key: "item_0_2".to_string(),
            outcome: ItemOutcome::Output("note".to_string()),
        }];
        let outcome =
            polling_batch(start).observe(BatchPoll::ended(results), start, Duration::hours(1));
        match outcome {
            PollOutcome::Completed(b) => assert_eq!(b.state.results.len(), 1),
            other => panic!("Expected Completed, got {:?}", other),
        }
    }

    #[test]
    fn test_failed_status_fails_batch() {
        let start = Utc::now();
        let outcome = polling_batch(start).observe(
            BatchPoll::failed("canceled"),
            start,
            Duration::hours(1),
        );
        match outcome {
            PollOutcome::Failed(b) => assert_eq!(b.state.reason, "canceled"),
            other => panic!("Expected Failed, got {:?}", other),
        }
    }

    #[test]
    fn test_in_progress_past_max_age_expires() {
        let start = Utc::now();
        let later = start + Duration::minutes(61);
        let outcome = polling_batch(start).observe(BatchPoll::in_progress(), later, Duration::hours(1));
        match outcome {
            PollOutcome::Expired(b) => assert_eq!(b.state.age_secs, 61 * 60),
            other => panic!("Expected Expired, got {:?}", other),
        }
    }

    #[test]
    fn test_completion_wins_over_age_limit() {
        let start = Utc::now();
        let later = start + Duration::hours(3);
        let outcome = polling_batch(start).observe(BatchPoll::ended(vec![]), later, Duration::hours(1));
        assert!(matches!(outcome, PollOutcome::Completed(_)));
    }

    #[test]
    fn test_poll_error_keeps_polling_until_expiry() {
        let start = Utc::now();
        let outcome = polling_batch(start).poll_errored(start, Duration::hours(1));
        let batch = match outcome {
            PollOutcome::InProgress(b) => b,
            other => panic!("Expected InProgress, got {:?}", other),
        };
        assert_eq!(batch.state.polls, 0);
        let outcome = batch.poll_errored(start + Duration::hours(2), Duration::hours(1));
        assert!(matches!(outcome, PollOutcome::Expired(_)));
    }

    #[test]
    fn test_is_due_respects_interval() {
        let start = Utc::now();
        let batch = polling_batch(start);
        assert!(batch.is_due(start, Duration::seconds(30)));
        let batch = match batch.observe(BatchPoll::in_progress(), start, Duration::hours(1)) {
            PollOutcome::InProgress(b) => b,
            other => panic!("Expected InProgress, got {:?}", other),
        };
        assert!(!batch.is_due(start + Duration::seconds(10), Duration::seconds(30)));
        assert!(batch.is_due(start + Duration::seconds(30), Duration::seconds(30)));
    }
}
