//! Fake phase executors shared across the integration suite.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::Semaphore;

use flowline::context::RequestContext;
use flowline::executor::{ExecutorError, PhaseExecution, PhaseExecutor, PhaseInput};

/// Succeeds immediately with a `{"<phase>_done": true}` delta.
#[derive(Debug, Clone, Default)]
pub struct EchoExecutor;

#[async_trait]
impl PhaseExecutor for EchoExecutor {
    async fn run(&self, input: PhaseInput) -> Result<PhaseExecution, ExecutorError> {
        let mut delta = Map::new();
        delta.insert(format!("{}_done", input.phase), json!(true));
        Ok(PhaseExecution::success(Value::Object(delta)))
    }
}

/// Pauses until the required key shows up in the merged state, then applies it.
#[derive(Debug, Clone)]
pub struct PausingExecutor {
    pub requires: &'static str,
}

#[async_trait]
impl PhaseExecutor for PausingExecutor {
    async fn run(&self, input: PhaseInput) -> Result<PhaseExecution, ExecutorError> {
        match input.state.get(self.requires) {
            Some(value) => {
                let mut delta = Map::new();
                delta.insert("applied".into(), value.clone());
                delta.insert(format!("{}_done", input.phase), json!(true));
                Ok(PhaseExecution::success(Value::Object(delta)))
            }
            None => Ok(PhaseExecution::paused(json!({
                "proposal": ["suggested_a", "suggested_b"],
            }))),
        }
    }
}

/// Fails with a transient error the first `fail_first` calls, then succeeds.
#[derive(Debug, Default)]
pub struct FlakyExecutor {
    pub fail_first: u32,
    calls: AtomicU32,
}

impl FlakyExecutor {
    pub fn new(fail_first: u32) -> Self {
        Self {
            fail_first,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl PhaseExecutor for FlakyExecutor {
    async fn run(&self, input: PhaseInput) -> Result<PhaseExecution, ExecutorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(ExecutorError::transient("upstream rate limited"));
        }
        Ok(PhaseExecution::success(json!({
            "attempt_succeeded": input.attempt,
        })))
    }
}

/// Succeeds and requests a forward jump to the named phase.
#[derive(Debug, Clone)]
pub struct JumpingExecutor {
    pub target: &'static str,
}

#[async_trait]
impl PhaseExecutor for JumpingExecutor {
    async fn run(&self, input: PhaseInput) -> Result<PhaseExecution, ExecutorError> {
        let mut delta = Map::new();
        delta.insert(format!("{}_done", input.phase), json!(true));
        Ok(PhaseExecution::success(Value::Object(delta)).with_next_phase(self.target))
    }
}

/// Always fails fatally.
#[derive(Debug, Clone)]
pub struct FailingExecutor {
    pub message: &'static str,
}

#[async_trait]
impl PhaseExecutor for FailingExecutor {
    async fn run(&self, _input: PhaseInput) -> Result<PhaseExecution, ExecutorError> {
        Err(ExecutorError::fatal(self.message))
    }
}

/// Sleeps past the phase timeout on the first call, then returns instantly.
#[derive(Debug, Default)]
pub struct SlowOnceExecutor {
    calls: AtomicU32,
}

#[async_trait]
impl PhaseExecutor for SlowOnceExecutor {
    async fn run(&self, input: PhaseInput) -> Result<PhaseExecution, ExecutorError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok(PhaseExecution::success(json!({
            "attempt_succeeded": input.attempt,
        })))
    }
}

/// Reports a skip.
#[derive(Debug, Clone)]
pub struct SkippingExecutor;

#[async_trait]
impl PhaseExecutor for SkippingExecutor {
    async fn run(&self, _input: PhaseInput) -> Result<PhaseExecution, ExecutorError> {
        Ok(PhaseExecution::skipped())
    }
}

/// Blocks on a semaphore until the test releases it.
#[derive(Debug, Clone)]
pub struct GatedExecutor {
    pub gate: Arc<Semaphore>,
}

impl GatedExecutor {
    pub fn new() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (Self { gate: gate.clone() }, gate)
    }
}

#[async_trait]
impl PhaseExecutor for GatedExecutor {
    async fn run(&self, input: PhaseInput) -> Result<PhaseExecution, ExecutorError> {
        let _permit = self.gate.acquire().await.ok();
        let mut delta = Map::new();
        delta.insert(format!("{}_done", input.phase), json!(true));
        Ok(PhaseExecution::success(Value::Object(delta)))
    }
}

/// Records the tenant it observed through the ambient context.
#[derive(Debug, Clone)]
pub struct ContextProbeExecutor;

#[async_trait]
impl PhaseExecutor for ContextProbeExecutor {
    async fn run(&self, input: PhaseInput) -> Result<PhaseExecution, ExecutorError> {
        let ctx = RequestContext::current()
            .map_err(|e| ExecutorError::fatal(format!("no ambient context: {e}")))?;
        let mut delta = Map::new();
        delta.insert(format!("{}_tenant", input.phase), json!(ctx.tenant_id));
        Ok(PhaseExecution::success(Value::Object(delta)))
    }
}
