use std::{future::Future, sync::Arc};

use tokio::{select, sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;

/// Runs one task per item with at most `parallelism` of them in flight.
///
/// Results land in a slot per input position, so the output order matches `items`
/// no matter which task finishes first. Returns `None` once `ct` is cancelled.
pub async fn run_indexed<T, R, Fut>(
    ct: &CancellationToken,
    parallelism: usize,
    items: Vec<T>,
    task: impl Fn(T) -> Fut,
) -> Option<Vec<R>>
where
    Fut: Future<Output = R> + Send + 'static,
    R: Send + 'static,
{
    let permits = Arc::new(Semaphore::new(parallelism.clamp(1, Semaphore::MAX_PERMITS)));
    let mut tasks = JoinSet::new();
    let len = items.len();

    for (index, item) in items.into_iter().enumerate() {
        let ct = ct.clone();
        let permits = permits.clone();
        let fut = task(item);

        tasks.spawn(async move {
            let _permit = select! {
                () = ct.cancelled() => return None,
                p = permits.acquire_owned() => p.ok()?,
            };

            select! {
                () = ct.cancelled() => None,
                r = fut => Some((index, r)),
            }
        });
    }

    let mut slots: Vec<Option<R>> = std::iter::repeat_with(|| None).take(len).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Some((index, r))) => slots[index] = Some(r),
            Ok(None) => {}
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => return None,
        }
    }

    if ct.is_cancelled() {
        return None;
    }
    slots.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn results_follow_input_order() {
        let ct = CancellationToken::new();
        // Later items finish first
        let results = run_indexed(&ct, 8, vec![40_u64, 30, 20, 10, 0], |ms| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            ms * 2
        })
        .await
        .unwrap();

        assert_eq!(results, vec![80, 60, 40, 20, 0]);
    }

    #[tokio::test]
    async fn never_exceeds_parallelism() {
        let ct = CancellationToken::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        run_indexed(&ct, 3, (0..20).collect(), |_: i32| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn cancellation_yields_none() {
        let ct = CancellationToken::new();
        let canceller = ct.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let results = run_indexed(&ct, 2, vec![(); 4], |()| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        })
        .await;

        assert!(results.is_none());
    }

    #[tokio::test]
    async fn empty_input() {
        let ct = CancellationToken::new();
        let results = run_indexed(&ct, 4, Vec::<u8>::new(), |x| async move { x }).await;
        assert_eq!(results, Some(vec![]));
    }
}
