use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::context::Context;
use crate::error::EvaluationError;
use crate::functions::{FunctionRegistry, PolicyFunction};
use crate::matcher::FunctionInvoker;

/// Default deadline for a single custom-function call.
pub const DEFAULT_FUNCTION_TIMEOUT: Duration = Duration::from_millis(50);

/// Default cap on worker threads alive at once, abandoned ones included.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// Time-boxed executor for registered custom functions.
///
/// Each call runs on its own short-lived thread and is awaited for at most
/// `deadline`. A call that misses the deadline is abandoned: the thread is
/// detached and its eventual result discarded. Panics and errors are
/// reported as [`EvaluationError`]s. A zero deadline runs calls inline,
/// still catching panics.
///
/// Abandoned workers keep their slot until they return, and at most
/// `max_in_flight` workers exist at once. When every slot is taken the call
/// fails with [`EvaluationError::Saturated`] without spawning, so a function
/// that never returns cannot grow the thread count without bound.
#[derive(Debug, Clone)]
pub struct FunctionRunner {
    registry: Arc<FunctionRegistry>,
    deadline: Duration,
    max_in_flight: usize,
    in_flight: Arc<AtomicUsize>,
}

/// A claimed worker slot, released when the worker thread finishes.
struct WorkerSlot(Arc<AtomicUsize>);

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl FunctionRunner {
    pub fn new(registry: Arc<FunctionRegistry>, deadline: Duration) -> Self {
        Self {
            registry,
            deadline,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Cap the number of live worker threads. Zero is treated as one.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Worker threads currently alive, including abandoned ones.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn claim_slot(&self) -> Option<WorkerSlot> {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_in_flight).then_some(n + 1)
            })
            .ok()
            .map(|_| WorkerSlot(Arc::clone(&self.in_flight)))
    }

    fn run_inline(
        name: &str,
        function: &dyn PolicyFunction,
        ctx: &Context,
        params: &Value,
    ) -> Result<bool, EvaluationError> {
        match catch_unwind(AssertUnwindSafe(|| function.call(ctx, params))) {
            Ok(Ok(verdict)) => Ok(verdict),
            Ok(Err(source)) => Err(EvaluationError::Failed {
                function: name.to_string(),
                source,
            }),
            Err(_) => Err(EvaluationError::Panicked {
                function: name.to_string(),
            }),
        }
    }

    fn run_boxed(
        &self,
        name: &str,
        function: Arc<dyn PolicyFunction>,
        ctx: &Context,
        params: &Value,
    ) -> Result<bool, EvaluationError> {
        let Some(slot) = self.claim_slot() else {
            tracing::warn!(
                function = name,
                limit = self.max_in_flight,
                "function workers saturated; not starting call"
            );
            return Err(EvaluationError::Saturated {
                function: name.to_string(),
                limit: self.max_in_flight,
            });
        };

        let (tx, rx) = mpsc::sync_channel(1);
        let ctx = ctx.clone();
        let params = params.clone();
        let thread_name = name.to_string();
        let fn_name = name.to_string();

        let spawned = std::thread::Builder::new()
            .name(format!("policy-fn-{thread_name}"))
            .spawn(move || {
                let _slot = slot;
                let result = Self::run_inline(&fn_name, function.as_ref(), &ctx, &params);
                // The receiver is gone if the caller already timed out.
                let _ = tx.send(result);
            });

        if let Err(err) = spawned {
            tracing::error!(function = name, error = %err, "failed to spawn function worker");
            return Err(EvaluationError::Failed {
                function: name.to_string(),
                source: crate::error::FunctionError::new(format!("worker spawn failed: {err}")),
            });
        }

        match rx.recv_timeout(self.deadline) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(EvaluationError::TimedOut {
                function: name.to_string(),
                deadline: self.deadline,
            }),
            // The worker exited without reporting; treat like a panic.
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(EvaluationError::Panicked {
                function: name.to_string(),
            }),
        }
    }
}

impl FunctionInvoker for FunctionRunner {
    fn invoke(&self, name: &str, ctx: &Context, params: &Value) -> Result<bool, EvaluationError> {
        let Some(function) = self.registry.get(name) else {
            return Err(EvaluationError::Unregistered {
                function: name.to_string(),
            });
        };

        if self.deadline.is_zero() {
            Self::run_inline(name, function.as_ref(), ctx, params)
        } else {
            self.run_boxed(name, function, ctx, params)
        }
    }
}
