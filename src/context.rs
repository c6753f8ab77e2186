//! Cooperative cancellation and deadlines for one logical call.
//!
//! A [`CallContext`] is threaded through every suspension point of a call:
//! the rate-limit wait, the pool wait, the network exchange and the backoff
//! sleep. Once it fires it stays fired.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Interrupt {
    Cancelled,
    DeadlineExceeded,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self::new().deadline(deadline)
    }

    /// Keeps the earlier of the current and the given deadline.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        self.deadline(Instant::now() + timeout)
    }

    /// Uses `token` as the cancel signal, e.g. one shared by a batch of calls.
    pub fn cancel_with(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// A context cancelled together with this one, with its own cancel signal.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline_at(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub(crate) fn check(&self) -> Result<(), Interrupt> {
        if self.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        if self.is_expired() {
            return Err(Interrupt::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drives `future` unless the context fires first. Cancellation wins ties.
    pub(crate) async fn run<F>(&self, future: F) -> Result<F::Output, Interrupt>
    where
        F: Future,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Interrupt::Cancelled),
            _ = sleep_until_deadline(self.deadline) => Err(Interrupt::DeadlineExceeded),
            output = future => Ok(output),
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{CallContext, Interrupt};

    #[tokio::test(flavor = "current_thread")]
    async fn cancelled_context_never_polls_the_future() {
        let context = CallContext::new();
        context.cancel();
        let mut polled = false;
        let result = context.run(async { polled = true }).await;
        assert_eq!(result, Err(Interrupt::Cancelled));
        assert!(!polled);
        assert!(context.is_cancelled());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn deadline_interrupts_slow_future() {
        let context = CallContext::with_timeout(Duration::from_millis(20));
        let started = Instant::now();
        let result = context
            .run(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert_eq!(result, Err(Interrupt::DeadlineExceeded));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancel_mid_wait_is_observed() {
        let context = CallContext::new();
        let canceller = context.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let result = context
            .run(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert_eq!(result, Err(Interrupt::Cancelled));
    }

    #[test]
    fn deadline_keeps_the_earliest_value() {
        let now = Instant::now();
        let context = CallContext::with_deadline(now + Duration::from_secs(1))
            .deadline(now + Duration::from_secs(10));
        assert_eq!(context.deadline_at(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn child_follows_parent_cancellation() {
        let parent = CallContext::new();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
        assert_eq!(child.check(), Err(Interrupt::Cancelled));
    }
}
