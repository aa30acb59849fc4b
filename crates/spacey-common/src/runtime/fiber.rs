// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Cooperative suspension primitive
//!
//! A fiber is one logical call stack, run as a tokio task. Code inside a
//! fiber can park itself at an I/O boundary with [`suspend`], handing the
//! returned [`Resumer`] to whatever component will observe the event. When
//! the event fires the component resumes the fiber with a value, or fails it
//! with an error that surfaces at the exact suspended call.
//!
//! ```ignore
//! let (resumer, suspension) = fiber::suspend::<usize>()?;
//! waiting_slot.store(resumer);
//! let n = suspension.wait().await?;
//! ```

use crate::error::{CommonError, Result};
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{oneshot, watch};

tokio::task_local! {
    static CURRENT: Fiber;
}

/// Unique fiber identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric id
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber-{}", self.0)
    }
}

/// Lifecycle of a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Executing, or ready to execute
    Running,
    /// Parked until an event resumes it
    Suspended,
    /// Returned successfully
    Completed,
    /// Returned an error or panicked
    Failed,
}

impl FiberState {
    /// Whether the fiber has finished
    pub fn is_terminal(&self) -> bool {
        matches!(self, FiberState::Completed | FiberState::Failed)
    }
}

struct FiberInner {
    id: FiberId,
    name: Option<String>,
    state: watch::Sender<FiberState>,
}

/// Handle to a logical call stack
#[derive(Clone)]
pub struct Fiber {
    inner: Arc<FiberInner>,
}

impl Fiber {
    fn new(name: Option<String>) -> Self {
        let (state, _) = watch::channel(FiberState::Running);
        Self {
            inner: Arc::new(FiberInner {
                id: FiberId::next(),
                name,
                state,
            }),
        }
    }

    /// The fiber running the current code.
    ///
    /// Fails with [`CommonError::NoCurrentFiber`] outside a spawned fiber.
    pub fn current() -> Result<Fiber> {
        CURRENT
            .try_with(Fiber::clone)
            .map_err(|_| CommonError::NoCurrentFiber)
    }

    /// The fiber's id
    pub fn id(&self) -> FiberId {
        self.inner.id
    }

    /// The fiber's name, if it was given one
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// The fiber's current state
    pub fn state(&self) -> FiberState {
        *self.inner.state.borrow()
    }

    /// Wait until the fiber has completed or failed
    pub async fn join(&self) -> FiberState {
        let mut rx = self.inner.state.subscribe();
        match rx.wait_for(FiberState::is_terminal).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    fn set_state(&self, state: FiberState) {
        self.inner.state.send_replace(state);
    }
}

impl fmt::Display for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.id()),
            None => write!(f, "{}", self.id()),
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Fiber configuration
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
}

impl Builder {
    /// Create a builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Name the fiber, for logging
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Spawn `future` as a new fiber.
    ///
    /// The fiber is scheduled before the spawner next yields to the event
    /// loop. An error or panic escaping the future is logged, and the
    /// fiber ends up [`FiberState::Failed`]; nothing reaches the spawner.
    pub fn spawn<F>(self, future: F) -> Fiber
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let fiber = Fiber::new(self.name);
        let handle = fiber.clone();

        tracing::trace!(fiber = %fiber, "spawning fiber");
        tokio::spawn(CURRENT.scope(fiber.clone(), async move {
            let outcome = AssertUnwindSafe(future).catch_unwind().await;
            let state = match outcome {
                Ok(Ok(())) => FiberState::Completed,
                Ok(Err(err)) => {
                    tracing::error!(fiber = %fiber, error = %err, "uncaught error in fiber");
                    FiberState::Failed
                }
                Err(panic) => {
                    tracing::error!(
                        fiber = %fiber,
                        panic = panic_message(panic.as_ref()),
                        "fiber panicked"
                    );
                    FiberState::Failed
                }
            };
            fiber.set_state(state);
        }));

        handle
    }
}

/// Spawn `future` as a new, unnamed fiber
pub fn spawn<F>(future: F) -> Fiber
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    Builder::new().spawn(future)
}

/// Run `future` in a new fiber and hand its result back to the caller.
///
/// This is how code outside any fiber enters the blocking-style API.
pub async fn run<F, T>(future: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let fiber = Builder::new().name("main").spawn(async move {
        // The receiver only goes away if the caller stopped waiting
        let _ = tx.send(future.await);
        Ok(())
    });

    rx.await.map_err(|_| {
        CommonError::state(format!("{} terminated without a result", fiber))
    })?
}

/// Park the current fiber until the returned [`Resumer`] is settled.
///
/// Fails with [`CommonError::NoCurrentFiber`] outside a spawned fiber.
pub fn suspend<T>() -> Result<(Resumer<T>, Suspension<T>)> {
    let fiber = Fiber::current()?;
    let (tx, rx) = oneshot::channel();
    Ok((
        Resumer {
            fiber: fiber.clone(),
            tx,
        },
        Suspension { fiber, rx },
    ))
}

/// Run `event` on the event loop and suspend the current fiber until it
/// completes, returning its outcome.
pub async fn wait_for<F, T>(event: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let (resumer, suspension) = suspend()?;
    tokio::spawn(async move {
        resumer.settle(event.await);
    });
    suspension.wait().await
}

/// The resuming half of a suspension, held by the event source
pub struct Resumer<T> {
    fiber: Fiber,
    tx: oneshot::Sender<Result<T>>,
}

impl<T> Resumer<T> {
    /// The fiber that will be resumed
    pub fn fiber(&self) -> &Fiber {
        &self.fiber
    }

    /// Whether the fiber is still waiting for this resumer
    pub fn is_waiting(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Resume the fiber, making the suspended call return `value`
    pub fn resume(self, value: T) {
        self.settle(Ok(value));
    }

    /// Resume the fiber, making the suspended call return `err`
    pub fn fail(self, err: CommonError) {
        self.settle(Err(err));
    }

    /// Resume the fiber with an outcome
    pub fn settle(self, result: Result<T>) {
        if self.tx.send(result).is_err() {
            tracing::trace!(fiber = %self.fiber, "fiber stopped waiting before it was resumed");
        }
    }
}

impl<T> fmt::Debug for Resumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resumer")
            .field("fiber", &self.fiber.id())
            .field("waiting", &self.is_waiting())
            .finish()
    }
}

/// The waiting half of a suspension, held by the suspended fiber
pub struct Suspension<T> {
    fiber: Fiber,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Suspension<T> {
    /// Yield to the event loop until resumed.
    ///
    /// Returns [`CommonError::Abandoned`] if the resumer is dropped without
    /// settling.
    pub async fn wait(self) -> Result<T> {
        let _guard = Parked::new(&self.fiber);
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(CommonError::Abandoned),
        }
    }
}

/// Marks a fiber suspended for as long as it is alive
struct Parked<'a> {
    fiber: &'a Fiber,
}

impl<'a> Parked<'a> {
    fn new(fiber: &'a Fiber) -> Self {
        fiber.set_state(FiberState::Suspended);
        Self { fiber }
    }
}

impl Drop for Parked<'_> {
    fn drop(&mut self) {
        self.fiber.set_state(FiberState::Running);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_returns_value() {
        let value = run(async { Ok(21 * 2) }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_current_outside_fiber() {
        assert!(matches!(Fiber::current(), Err(CommonError::NoCurrentFiber)));
        assert!(matches!(suspend::<()>(), Err(CommonError::NoCurrentFiber)));
    }

    #[tokio::test]
    async fn test_resume_delivers_value() {
        let slot: Arc<Mutex<Option<Resumer<u32>>>> = Arc::new(Mutex::new(None));
        let waiter_slot = slot.clone();

        let fiber = spawn(async move {
            let (resumer, suspension) = suspend::<u32>()?;
            *waiter_slot.lock() = Some(resumer);
            assert_eq!(suspension.wait().await?, 7);
            Ok(())
        });

        while slot.lock().is_none() {
            tokio::task::yield_now().await;
        }
        assert_eq!(fiber.state(), FiberState::Suspended);

        let resumer = slot.lock().take().unwrap();
        assert_eq!(resumer.fiber().id(), fiber.id());
        resumer.resume(7);
        assert_eq!(fiber.join().await, FiberState::Completed);
    }

    #[tokio::test]
    async fn test_fail_surfaces_at_call_site() {
        let result = run(async {
            let (resumer, suspension) = suspend::<()>()?;
            resumer.fail(CommonError::io(std::io::ErrorKind::ConnectionReset, "reset"));
            suspension.wait().await
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.io_kind(), Some(std::io::ErrorKind::ConnectionReset));
    }

    #[tokio::test]
    async fn test_dropped_resumer_abandons() {
        let result = run(async {
            let (resumer, suspension) = suspend::<()>()?;
            drop(resumer);
            suspension.wait().await
        })
        .await;
        assert!(matches!(result, Err(CommonError::Abandoned)));
    }

    #[tokio::test]
    async fn test_errors_do_not_reach_spawner() {
        let failing = Builder::new()
            .name("doomed")
            .spawn(async { Err(CommonError::state("boom")) });
        let panicking = spawn(async {
            if true {
                panic!("kaboom");
            }
            Ok(())
        });

        assert_eq!(failing.name(), Some("doomed"));
        assert_eq!(failing.join().await, FiberState::Failed);
        assert_eq!(panicking.join().await, FiberState::Failed);
    }

    #[tokio::test]
    async fn test_spawned_fiber_runs_before_next_turn() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner = log.clone();

        run(async move {
            let child_log = inner.clone();
            let child = spawn(async move {
                child_log.lock().push("child");
                Ok(())
            });
            inner.lock().push("parent");
            wait_for(async { Ok(()) }).await?;
            inner.lock().push("parent resumed");
            child.join().await;
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(*log.lock(), vec!["parent", "child", "parent resumed"]);
    }

    #[tokio::test]
    async fn test_wait_for_timer() {
        let started = tokio::time::Instant::now();
        run(async {
            wait_for(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(())
            })
            .await
        })
        .await
        .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(10));
    }
}
