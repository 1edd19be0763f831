//! Cooperative shutdown primitive coupling reader, writer, and dispatcher
//! tasks of a control connection.
//!
//! A [`WorkGroup`] tracks a set of cooperating tasks and carries the
//! terminal error of the connection. Any task that fails closes the group,
//! which cancels the `closing` token; its peers observe the token and exit
//! promptly. The group is fully closed once closing has begun and the last
//! registered task has returned.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::TunnelError;

/// Tracks cooperating tasks and the terminal error of a connection.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone, Default)]
pub struct WorkGroup {
    closing: CancellationToken,
    tracker: TaskTracker,
    errors: Arc<Mutex<Vec<TunnelError>>>,
}

impl WorkGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register and spawn a cooperating task.
    ///
    /// The task does not start if the group is already fully closed, i.e.
    /// closing has fired and the last registered task has returned. While
    /// the group is still draining, new tasks may start and race the
    /// closing token. An `Err` return closes the group with that error; a
    /// panic is caught and closes the group with [`TunnelError::LoopPanic`]
    /// so the connection tears down deterministically.
    pub fn go<F>(&self, context: &'static str, fut: F)
    where
        F: std::future::Future<Output = Result<(), TunnelError>> + Send + 'static,
    {
        if self.tracker.is_closed() && self.tracker.is_empty() {
            tracing::debug!(context, "work group closed, not starting task");
            return;
        }
        let group = self.clone();
        let _ = self.tracker.spawn(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => group.close(Some(err)),
                Err(panic) => group.close(Some(TunnelError::LoopPanic {
                    context,
                    message: panic_message(panic),
                })),
            }
        });
    }

    /// Initiate shutdown, recording `err` if present.
    ///
    /// The first call cancels the closing token; later calls only append
    /// their error. Calls after the group has fully closed are ignored.
    pub fn close(&self, err: Option<TunnelError>) {
        if self.tracker.is_closed() && self.tracker.is_empty() {
            return;
        }
        if let Some(err) = err {
            self.errors.lock().expect("work group error lock poisoned").push(err);
        }
        self.closing.cancel();
    }

    /// Token cancelled when shutdown begins.
    pub fn closing(&self) -> CancellationToken {
        self.closing.clone()
    }

    /// Whether shutdown has not yet been initiated.
    pub fn is_open(&self) -> bool {
        !self.closing.is_cancelled()
    }

    /// The accumulated error so far, folded into a single value.
    pub fn error(&self) -> Option<TunnelError> {
        let errors = self.errors.lock().expect("work group error lock poisoned");
        TunnelError::aggregate(errors.clone())
    }

    /// Block until shutdown has begun and every registered task has
    /// returned, then yield the accumulated error.
    pub async fn wait(&self) -> Option<TunnelError> {
        self.closing.cancelled().await;
        self.tracker.close();
        self.tracker.wait().await;
        self.error()
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_close_records_error() {
        let group = WorkGroup::new();
        group.close(Some(TunnelError::ServerStopped));
        let err = group.wait().await.unwrap();
        assert!(matches!(err, TunnelError::ServerStopped));
    }

    #[tokio::test]
    async fn test_clean_close_has_no_error() {
        let group = WorkGroup::new();
        group.close(None);
        assert!(group.wait().await.is_none());
    }

    #[tokio::test]
    async fn test_wait_blocks_for_registered_tasks() {
        let group = WorkGroup::new();
        let finished = Arc::new(AtomicBool::new(false));

        let flag = finished.clone();
        group.go("test task", async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        group.close(None);
        group.wait().await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failing_task_closes_group() {
        let group = WorkGroup::new();
        group.go("failing task", async {
            Err(TunnelError::Transport("socket reset".into()))
        });

        let err = group.wait().await.unwrap();
        assert!(matches!(err, TunnelError::Transport(_)));
        assert!(!group.is_open());
    }

    #[tokio::test]
    async fn test_panicking_task_closes_group() {
        let group = WorkGroup::new();
        group.go("panicky task", async {
            panic!("boom");
        });

        let err = group.wait().await.unwrap();
        match err {
            TunnelError::LoopPanic { message, .. } => assert_eq!(message, "boom"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_draining_group_still_accepts_tasks() {
        let group = WorkGroup::new();
        let (release, held) = tokio::sync::oneshot::channel::<()>();
        group.go("held task", async move {
            let _ = held.await;
            Ok(())
        });

        // Begin shutdown and let wait() observe it; the held task keeps
        // the group in the draining state.
        group.close(None);
        let waiter = {
            let group = group.clone();
            tokio::spawn(async move { group.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A re-queue or dispatch arriving mid-drain must still run.
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        group.go("late task", async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        release.send(()).ok();
        assert!(waiter.await.unwrap().is_none());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_fully_closed_group_refuses_tasks() {
        let group = WorkGroup::new();
        group.close(None);
        group.wait().await;

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        group.go("too late", async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_errors_aggregate_across_calls() {
        let group = WorkGroup::new();
        group.close(Some(TunnelError::Transport("write failed".into())));
        group.close(Some(TunnelError::Transport("read failed".into())));

        let err = group.wait().await.unwrap();
        assert!(matches!(err, TunnelError::Aggregate(ref errs) if errs.len() == 2));
    }

    #[tokio::test]
    async fn test_peers_observe_closing() {
        let group = WorkGroup::new();
        let closing = group.closing();
        group.go("waiting peer", async move {
            closing.cancelled().await;
            Ok(())
        });

        group.close(None);
        // Must not hang: the peer exits once closing fires.
        tokio::time::timeout(Duration::from_secs(1), group.wait())
            .await
            .expect("group did not close in time");
    }
}
