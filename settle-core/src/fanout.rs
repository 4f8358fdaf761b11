//! Fan-out - Run independent fetches with a concurrency ceiling
//!
//! Used by list operations that enrich every item with a second remote call
//! (e.g., tags per image). Items run at most `concurrency` at a time, results
//! are put back in input order, and a failing item never aborts the batch.

use std::future::Future;

use futures::stream::{self, StreamExt};

use crate::cancel::CancelToken;

/// Error type for a fan-out batch as a whole
///
/// Per-item failures are not errors of the batch; they are reported in
/// [`FanOutReport`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FanOutError {
    #[error("Concurrency must be at least 1, got {0}")]
    InvalidConcurrency(usize),

    #[error("Fan-out cancelled after {completed} of {total} items ({failed} failed)")]
    Cancelled {
        completed: usize,
        failed: usize,
        total: usize,
    },
}

/// Result of one item, tagged with its input position
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult<T, E> {
    pub index: usize,
    pub outcome: Result<T, E>,
}

/// Results of a completed fan-out, in input order
#[derive(Debug, Clone)]
pub struct FanOutReport<T, E> {
    results: Vec<FetchResult<T, E>>,
}

impl<T, E> FanOutReport<T, E> {
    /// Successful values in input order; failed items are left out
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.results.iter().filter_map(|r| r.outcome.as_ref().ok())
    }

    pub fn into_values(self) -> Vec<T> {
        self.results
            .into_iter()
            .filter_map(|r| r.outcome.ok())
            .collect()
    }

    /// Failed items with their input index
    pub fn failures(&self) -> impl Iterator<Item = (usize, &E)> {
        self.results
            .iter()
            .filter_map(|r| r.outcome.as_ref().err().map(|e| (r.index, e)))
    }

    pub fn failure_count(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_err()).count()
    }

    /// Every result, one per input item
    pub fn results(&self) -> &[FetchResult<T, E>] {
        &self.results
    }

    /// Split into successful values and indexed failures
    pub fn into_parts(self) -> (Vec<T>, Vec<(usize, E)>) {
        let mut values = Vec::with_capacity(self.results.len());
        let mut failures = Vec::new();
        for result in self.results {
            match result.outcome {
                Ok(value) => values.push(value),
                Err(e) => failures.push((result.index, e)),
            }
        }
        (values, failures)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Run `map_fn` over `items` with at most `concurrency` calls in flight
///
/// Completion order is arbitrary; the report is in input order. After
/// `cancel` fires no further items are started, in-flight calls are dropped
/// and [`FanOutError::Cancelled`] is returned.
pub async fn fan_out<I, T, E, F, Fut>(
    items: Vec<I>,
    concurrency: usize,
    cancel: &CancelToken,
    mut map_fn: F,
) -> Result<FanOutReport<T, E>, FanOutError>
where
    F: FnMut(I) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    if concurrency == 0 {
        return Err(FanOutError::InvalidConcurrency(concurrency));
    }

    let total = items.len();
    let mut slots: Vec<Option<Result<T, E>>> = (0..total).map(|_| None).collect();
    let mut completed = 0;
    let mut failed = 0;

    let mut pending = std::pin::pin!(
        stream::iter(items.into_iter().enumerate())
            .take_while(|_| futures::future::ready(!cancel.is_cancelled()))
            .map(|(index, item)| {
                let fut = map_fn(item);
                async move { (index, fut.await) }
            })
            .buffer_unordered(concurrency)
    );

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            next = pending.next() => Some(next),
        };

        match next {
            // Cancelled
            None => {
                log::debug!(
                    "Fan-out cancelled with {} of {} items completed",
                    completed,
                    total
                );
                return Err(FanOutError::Cancelled {
                    completed,
                    failed,
                    total,
                });
            }
            Some(None) => break,
            Some(Some((index, outcome))) => {
                completed += 1;
                if outcome.is_err() {
                    failed += 1;
                }
                slots[index] = Some(outcome);
            }
        }
    }

    // The stream also stops early when cancel fires between two items
    if completed < total {
        return Err(FanOutError::Cancelled {
            completed,
            failed,
            total,
        });
    }

    let results = slots
        .into_iter()
        .enumerate()
        .filter_map(|(index, slot)| slot.map(|outcome| FetchResult { index, outcome }))
        .collect();

    Ok(FanOutReport { results })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSource;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    /// Tracks how many calls are in flight and the highest value seen
    #[derive(Default)]
    struct InFlight {
        current: AtomicUsize,
        peak: AtomicUsize,
        started: AtomicUsize,
    }

    impl InFlight {
        fn enter(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn every_seventh_failure_is_omitted_and_counted() {
        let items: Vec<usize> = (0..50).collect();
        let in_flight = Arc::new(InFlight::default());

        let tracker = in_flight.clone();
        let report = fan_out(items, 5, &CancelToken::never(), move |i| {
            let tracker = tracker.clone();
            async move {
                tracker.enter();
                sleep(Duration::from_millis(5 + (i as u64 * 7) % 13)).await;
                tracker.exit();
                if (i + 1) % 7 == 0 {
                    Err(format!("tags for item {} unavailable", i))
                } else {
                    Ok(i * 10)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(report.len(), 50);
        assert_eq!(report.failure_count(), 7);

        let failed: Vec<usize> = report.failures().map(|(i, _)| i).collect();
        assert_eq!(failed, vec![6, 13, 20, 27, 34, 41, 48]);

        let expected: Vec<usize> = (0..50)
            .filter(|i| (i + 1) % 7 != 0)
            .map(|i| i * 10)
            .collect();
        assert_eq!(report.into_values(), expected);

        assert!(in_flight.peak.load(Ordering::SeqCst) <= 5);
        assert_eq!(in_flight.peak.load(Ordering::SeqCst), 5);
        assert_eq!(in_flight.started.load(Ordering::SeqCst), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn preserves_input_order_when_completing_out_of_order() {
        let items = vec!["A", "B", "C", "D", "E", "F"];
        let finished = Arc::new(std::sync::Mutex::new(Vec::new()));

        let log = finished.clone();
        let total = items.len();
        let inputs = items.clone();
        let report = fan_out(items, total, &CancelToken::never(), move |name| {
            let log = log.clone();
            let position = inputs.iter().position(|n| *n == name).unwrap();
            async move {
                // Earlier items sleep longer
                sleep(Duration::from_millis(((total - position) * 10) as u64)).await;
                log.lock().unwrap().push(name);
                Ok::<_, String>(name.to_lowercase())
            }
        })
        .await
        .unwrap();

        assert_eq!(
            *finished.lock().unwrap(),
            vec!["F", "E", "D", "C", "B", "A"]
        );
        let values: Vec<&String> = report.values().collect();
        assert_eq!(values, vec!["a", "b", "c", "d", "e", "f"]);
        for (i, result) in report.results().iter().enumerate() {
            assert_eq!(result.index, i);
        }
    }

    #[tokio::test]
    async fn zero_concurrency_is_rejected() {
        let result = fan_out(vec![1, 2, 3], 0, &CancelToken::never(), |i| async move {
            Ok::<_, String>(i)
        })
        .await;

        assert_eq!(result.unwrap_err(), FanOutError::InvalidConcurrency(0));
    }

    #[tokio::test]
    async fn empty_input_gives_empty_report() {
        let report = fan_out(Vec::<u32>::new(), 4, &CancelToken::never(), |i| async move {
            Ok::<_, String>(i)
        })
        .await
        .unwrap();

        assert!(report.is_empty());
        assert_eq!(report.failure_count(), 0);
    }

    #[tokio::test]
    async fn concurrency_larger_than_input() {
        let report = fan_out(vec![1, 2, 3], 64, &CancelToken::never(), |i| async move {
            Ok::<_, String>(i * 2)
        })
        .await
        .unwrap();

        assert_eq!(report.into_values(), vec![2, 4, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_dispatching_new_items() {
        let items: Vec<usize> = (0..20).collect();
        let in_flight = Arc::new(InFlight::default());
        let source = CancelSource::new();
        let token = source.token();

        let tracker = in_flight.clone();
        let batch = fan_out(items, 2, &token, move |i| {
            let tracker = tracker.clone();
            async move {
                tracker.enter();
                sleep(Duration::from_secs(10)).await;
                tracker.exit();
                Ok::<_, String>(i)
            }
        });
        let canceller = async {
            sleep(Duration::from_secs(25)).await;
            source.cancel();
        };
        let (result, _) = tokio::join!(batch, canceller);

        match result.unwrap_err() {
            FanOutError::Cancelled {
                completed,
                failed,
                total,
            } => {
                assert_eq!(completed, 4);
                assert_eq!(failed, 0);
                assert_eq!(total, 20);
            }
            other => panic!("Expected Cancelled, got {:?}", other),
        }
        // Only the two items running at cancel time were started beyond the completed ones
        assert!(in_flight.started.load(Ordering::SeqCst) <= 6);
    }

    #[tokio::test]
    async fn already_cancelled_runs_nothing() {
        let source = CancelSource::new();
        source.cancel();
        let started = Arc::new(AtomicUsize::new(0));

        let counter = started.clone();
        let result = fan_out(vec![1, 2, 3], 2, &source.token(), move |i| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, String>(i) }
        })
        .await;

        assert!(matches!(
            result,
            Err(FanOutError::Cancelled { completed: 0, .. })
        ));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn into_parts_splits_values_and_failures() {
        let report = FanOutReport {
            results: vec![
                FetchResult {
                    index: 0,
                    outcome: Ok("img-1"),
                },
                FetchResult {
                    index: 1,
                    outcome: Err("timeout"),
                },
                FetchResult {
                    index: 2,
                    outcome: Ok("img-3"),
                },
            ],
        };

        let (values, failures) = report.into_parts();
        assert_eq!(values, vec!["img-1", "img-3"]);
        assert_eq!(failures, vec![(1, "timeout")]);
    }

    #[test]
    fn cancelled_error_display() {
        let err = FanOutError::Cancelled {
            completed: 3,
            failed: 1,
            total: 10,
        };
        assert_eq!(
            err.to_string(),
            "Fan-out cancelled after 3 of 10 items (1 failed)"
        );
    }
}
