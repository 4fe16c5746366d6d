use std::future::Future;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;

/// Coalesces concurrent executions of an async operation: while one is in
/// flight every caller awaits the same future and receives a clone of its
/// result. Any await point may interleave with a second call, so the slot is
/// checked and installed under one lock acquisition.
pub struct SingleFlight<T: Clone> {
    inflight: Mutex<Option<Shared<BoxFuture<'static, T>>>>,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(None),
        }
    }

    /// Join the in-flight operation, or start a new one with `make`.
    pub async fn run<F, Fut>(&self, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let fut = {
            let mut slot = self.inflight.lock().await;
            match slot.as_ref() {
                // A still-pending flight: join it.
                Some(f) if f.peek().is_none() => f.clone(),
                // Empty, or a completed flight left behind by a racing
                // waiter: start fresh.
                _ => {
                    let f = make().boxed().shared();
                    *slot = Some(f.clone());
                    f
                }
            }
        };
        let out = fut.await;
        let mut slot = self.inflight.lock().await;
        if slot.as_ref().is_some_and(|f| f.peek().is_some()) {
            *slot = None;
        }
        out
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn concurrent_calls_share_one_execution() {
        let flight = Arc::new(SingleFlight::<u32>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let flight = flight.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run(move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        7u32
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 7);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sequential_calls_run_separately() {
        let flight = SingleFlight::<u32>::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let runs = runs.clone();
            flight
                .run(move || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    1u32
                })
                .await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
