//! Runs one function over a list of items, sequentially or on a bounded
//! pool of tokio tasks, with per-item retry and a failure policy.

use chrono::Utc;
use flowcore::{
    BatchConfig, BatchItemError, ErrorHandling, EventBus, ExecutionEvent, ExecutionId, FlowError,
    Map, Value,
};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// One invocation of the per-item function.
#[derive(Debug, Clone)]
pub struct ItemCall {
    pub index: usize,
    pub item: Value,
    /// 1-based, counted per item
    pub attempt: u32,
}

pub type ItemFuture = BoxFuture<'static, Result<Value, FlowError>>;

/// Per-item work. Called once per attempt.
pub type ItemFn = Arc<dyn Fn(ItemCall) -> ItemFuture + Send + Sync>;

/// Ordered results of a finished batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// One slot per input item; `null` where a tolerated failure occurred
    pub results: Vec<Value>,
    /// Every tolerated failure, ordered by item index
    pub errors: Vec<BatchItemError>,
}

impl BatchOutcome {
    pub fn count(&self) -> usize {
        self.results.len()
    }

    pub fn success_count(&self) -> usize {
        self.results.len() - self.errors.len()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// The aggregate output mapping written for a batch node.
    pub fn into_output(self) -> Map<String, Value> {
        let mut output = Map::new();
        output.insert("count".into(), self.count().into());
        output.insert("success_count".into(), self.success_count().into());
        output.insert("error_count".into(), self.error_count().into());
        let errors = if self.errors.is_empty() {
            Value::Null
        } else {
            serde_json::to_value(&self.errors).unwrap_or(Value::Null)
        };
        output.insert("errors".into(), errors);
        output.insert("results".into(), Value::Array(self.results));
        output
    }
}

#[derive(Clone)]
struct ItemEvents {
    bus: Arc<EventBus>,
    execution_id: ExecutionId,
    node_id: String,
}

impl ItemEvents {
    fn retry(&self, index: usize, attempt: u32, error: &str) {
        self.bus.emit(ExecutionEvent::BatchItemRetry {
            execution_id: self.execution_id,
            node_id: self.node_id.clone(),
            index,
            attempt,
            error: error.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn failed(&self, index: usize, error: &str) {
        self.bus.emit(ExecutionEvent::BatchItemFailed {
            execution_id: self.execution_id,
            node_id: self.node_id.clone(),
            index,
            error: error.to_string(),
            timestamp: Utc::now(),
        });
    }
}

#[derive(Clone, Copy)]
struct RetryPolicy {
    attempts: u32,
    delay: Option<Duration>,
}

pub struct BatchExecutor {
    config: BatchConfig,
    concurrency: usize,
    events: Option<ItemEvents>,
}

impl BatchExecutor {
    /// `default_max_concurrent` applies when the config leaves the pool size
    /// unset; `max_concurrent_cap` bounds it either way.
    pub fn new(config: BatchConfig, default_max_concurrent: usize, max_concurrent_cap: usize) -> Self {
        let concurrency = config.effective_concurrency(default_max_concurrent, max_concurrent_cap);
        Self {
            config,
            concurrency,
            events: None,
        }
    }

    /// Emit per-item retry and failure events on `bus`.
    pub fn with_events(
        mut self,
        bus: Arc<EventBus>,
        execution_id: ExecutionId,
        node_id: impl Into<String>,
    ) -> Self {
        self.events = Some(ItemEvents {
            bus,
            execution_id,
            node_id: node_id.into(),
        });
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub async fn run(&self, items: Vec<Value>, per_item: ItemFn) -> Result<BatchOutcome, FlowError> {
        if items.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let policy = RetryPolicy {
            attempts: self.config.attempts(),
            delay: self.config.retry_delay(),
        };

        if self.config.parallel {
            debug!(
                items = items.len(),
                concurrency = self.concurrency,
                "Dispatching batch to worker pool"
            );
            self.run_parallel(items, per_item, policy).await
        } else {
            debug!(items = items.len(), "Running batch sequentially");
            self.run_sequential(items, per_item, policy).await
        }
    }

    async fn run_sequential(
        &self,
        items: Vec<Value>,
        per_item: ItemFn,
        policy: RetryPolicy,
    ) -> Result<BatchOutcome, FlowError> {
        let total = items.len();
        let mut outcome = BatchOutcome {
            results: Vec::with_capacity(total),
            errors: Vec::new(),
        };

        for (index, item) in items.into_iter().enumerate() {
            match run_with_retry(index, item, Arc::clone(&per_item), policy, self.events.clone()).await {
                Ok(value) => outcome.results.push(value),
                Err(error) => {
                    self.tolerate_or_abort(error, &mut outcome, total)?;
                    outcome.results.push(Value::Null);
                }
            }
        }

        Ok(outcome)
    }

    async fn run_parallel(
        &self,
        items: Vec<Value>,
        per_item: ItemFn,
        policy: RetryPolicy,
    ) -> Result<BatchOutcome, FlowError> {
        let total = items.len();
        let mut outcome = BatchOutcome {
            results: vec![Value::Null; total],
            errors: Vec::new(),
        };
        let mut pending = items.into_iter().enumerate();
        let mut join_set: JoinSet<(usize, Result<Value, BatchItemError>)> = JoinSet::new();
        let mut abort: Option<BatchItemError> = None;
        let mut succeeded = 0usize;

        let spawn_next = |join_set: &mut JoinSet<(usize, Result<Value, BatchItemError>)>,
                          pending: &mut std::iter::Enumerate<std::vec::IntoIter<Value>>| {
            if let Some((index, item)) = pending.next() {
                let per_item = Arc::clone(&per_item);
                let events = self.events.clone();
                join_set.spawn(async move {
                    (index, run_with_retry(index, item, per_item, policy, events).await)
                });
            }
        };

        for _ in 0..self.concurrency {
            spawn_next(&mut join_set, &mut pending);
        }

        // Already-running items finish after a fail-fast abort; their results
        // are dropped.
        while let Some(joined) = join_set.join_next().await {
            let (index, result) =
                joined.map_err(|e| FlowError::Execution(format!("Batch worker failed: {}", e)))?;

            match result {
                Ok(value) => {
                    outcome.results[index] = value;
                    succeeded += 1;
                }
                Err(error) => match self.config.error_handling {
                    ErrorHandling::FailFast => {
                        if abort.is_none() {
                            abort = Some(error);
                        }
                    }
                    ErrorHandling::Continue => {
                        self.record_tolerated(&error);
                        outcome.errors.push(error);
                    }
                },
            }

            if abort.is_none() {
                spawn_next(&mut join_set, &mut pending);
            }
        }

        if let Some(error) = abort {
            return Err(FlowError::BatchAborted {
                error,
                succeeded,
                total,
            });
        }

        outcome.errors.sort_by_key(|e| e.index);
        Ok(outcome)
    }

    fn tolerate_or_abort(
        &self,
        error: BatchItemError,
        outcome: &mut BatchOutcome,
        total: usize,
    ) -> Result<(), FlowError> {
        match self.config.error_handling {
            ErrorHandling::FailFast => Err(FlowError::BatchAborted {
                succeeded: outcome.results.len() - outcome.errors.len(),
                error,
                total,
            }),
            ErrorHandling::Continue => {
                self.record_tolerated(&error);
                outcome.errors.push(error);
                Ok(())
            }
        }
    }

    fn record_tolerated(&self, error: &BatchItemError) {
        warn!(index = error.index, error = %error.message, "Batch item failed, continuing");
        if let Some(events) = &self.events {
            events.failed(error.index, &error.message);
        }
    }
}

/// Runs one item until it succeeds or its attempts run out. The attempt
/// counter lives on this call's stack.
async fn run_with_retry(
    index: usize,
    item: Value,
    per_item: ItemFn,
    policy: RetryPolicy,
    events: Option<ItemEvents>,
) -> Result<Value, BatchItemError> {
    let mut attempt = 1;
    loop {
        let call = ItemCall {
            index,
            item: item.clone(),
            attempt,
        };
        match per_item(call).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.attempts => {
                warn!(index, attempt, error = %e, "Batch item failed, retrying");
                if let Some(events) = &events {
                    events.retry(index, attempt, &e.to_string());
                }
                if let Some(delay) = policy.delay {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
            Err(e) => {
                return Err(BatchItemError {
                    index,
                    item,
                    message: e.root_cause().to_string(),
                })
            }
        }
    }
}
