//! Bounded admission gate limiting concurrently running compactions.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::logging::maint_log;

/// The gate was torn down while a requester was waiting.
#[derive(Debug, Error)]
pub enum ThrottleError {
    /// No more tokens will ever be granted.
    #[error("throttle {0} is closed")]
    Closed(&'static str),
}

/// Named admission gate with a bounded number of tokens.
///
/// A granted token is returned when its [`ThrottlePermit`] drops, which also
/// covers a holder that panics or is aborted mid-compaction — a crashed
/// holder cannot leak a slot. Forced operations bypass admission by simply
/// not acquiring.
#[derive(Debug)]
pub struct Throttle {
    name: &'static str,
    sem: Arc<Semaphore>,
    limit: AtomicUsize,
}

impl Throttle {
    /// Create a gate with `limit` tokens (floored at one).
    pub fn new(name: &'static str, limit: usize) -> Arc<Self> {
        let limit = limit.max(1);
        Arc::new(Self {
            name,
            sem: Arc::new(Semaphore::new(limit)),
            limit: AtomicUsize::new(limit),
        })
    }

    /// Suspend until a token is granted.
    pub async fn acquire(&self) -> Result<ThrottlePermit, ThrottleError> {
        let permit = Arc::clone(&self.sem)
            .acquire_owned()
            .await
            .map_err(|_| ThrottleError::Closed(self.name))?;
        Ok(ThrottlePermit { _permit: permit })
    }

    /// Change the token count; takes effect for subsequent admissions.
    ///
    /// Shrinking reclaims the excess tokens as their holders release them.
    pub fn set_limit(&self, limit: usize) {
        let limit = limit.max(1);
        let old = self.limit.swap(limit, Ordering::SeqCst);
        if limit == old {
            return;
        }
        maint_log!(
            log::Level::Debug,
            "throttle_resized",
            "name={} old={old} new={limit}",
            self.name,
        );
        if limit > old {
            self.sem.add_permits(limit - old);
        } else {
            let sem = Arc::clone(&self.sem);
            let excess = (old - limit) as u32;
            tokio::spawn(async move {
                if let Ok(reclaimed) = sem.acquire_many_owned(excess).await {
                    reclaimed.forget();
                }
            });
        }
    }

    /// Configured token count.
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }
}

/// RAII token; dropping it returns the slot to the gate.
#[derive(Debug)]
pub struct ThrottlePermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    use super::*;

    #[tokio::test]
    async fn limit_one_admits_one_at_a_time() {
        let throttle = Throttle::new("test", 1);
        let first = throttle.acquire().await.expect("first");
        assert!(
            timeout(Duration::from_millis(50), throttle.acquire())
                .await
                .is_err(),
            "second requester must stay suspended while the token is held"
        );
        drop(first);
        timeout(Duration::from_millis(50), throttle.acquire())
            .await
            .expect("token released")
            .expect("second");
    }

    #[tokio::test]
    async fn aborted_holder_releases_its_token() {
        let throttle = Throttle::new("test", 1);
        let holder = {
            let throttle = Arc::clone(&throttle);
            tokio::spawn(async move {
                let _permit = throttle.acquire().await.expect("holder");
                sleep(Duration::from_secs(60)).await;
            })
        };
        // Let the holder actually take the token before killing it.
        sleep(Duration::from_millis(20)).await;
        holder.abort();
        timeout(Duration::from_millis(200), throttle.acquire())
            .await
            .expect("token must be released by the dead holder")
            .expect("waiter");
    }

    #[tokio::test]
    async fn growing_the_limit_admits_more() {
        let throttle = Throttle::new("test", 1);
        let _held = throttle.acquire().await.expect("first");
        throttle.set_limit(2);
        timeout(Duration::from_millis(50), throttle.acquire())
            .await
            .expect("second token available after grow")
            .expect("second");
        assert_eq!(throttle.limit(), 2);
    }
}
