use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::buffers::{Buffer, BufferList};
use crate::core::{DataContext, FlowError, FlowUnit, RuntimeConfig, StatusCode};
use crate::observability::MetricsCollector;
use crate::resilience::ErrorPolicy;

/// Port carrying errored buffers emitted under `ErrorPolicy::MarkError`
pub const ERROR_PORT: &str = "error";

/// Buffers written to one output port by one `process` call
#[derive(Debug)]
pub struct OutputBatch {
    pub unit_id: String,
    pub port: String,
    pub sequence: u64,
    pub buffers: BufferList,
}

/// How a stream ended
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    /// Finished with a non-error status
    Finished(StatusCode),
    /// Stopped by an error under `ErrorPolicy::Propagate`
    Failed(FlowError),
    /// An error ended the stream but the policy absorbed it
    Absorbed(FlowError),
    /// No event arrived within the configured timeout
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct StreamReport {
    pub unit_id: String,
    pub outcome: StreamOutcome,
    pub invocations: u64,
    pub batches: u64,
}

impl StreamReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, StreamOutcome::Finished(_))
    }
}

/// Drives flow unit streams on the tokio runtime with a bounded worker count
#[derive(Clone)]
pub struct StreamExecutor {
    semaphore: Arc<Semaphore>,
    max_workers: usize,
    event_timeout: Option<Duration>,
    error_policy: ErrorPolicy,
    collector: Arc<MetricsCollector>,
}

impl StreamExecutor {
    pub fn new(config: &RuntimeConfig) -> Self {
        let max_workers = config.max_workers.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            event_timeout: config.event_timeout(),
            error_policy: config.error_policy,
            collector: Arc::new(MetricsCollector::new()),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.collector
    }

    pub fn spawn_stream(
        &self,
        unit_id: impl Into<String>,
        unit: Arc<dyn FlowUnit>,
        ctx: DataContext,
        tx: mpsc::Sender<OutputBatch>,
    ) -> JoinHandle<Result<StreamReport>> {
        let executor = self.clone();
        let unit_id = unit_id.into();
        tokio::spawn(async move { executor.run_stream(&unit_id, unit, ctx, tx).await })
    }

    /// Runs `data_pre`, `process` until the stream ends, then `data_post`
    ///
    /// Each invocation holds a worker permit; waiting for the next event
    /// happens without one.
    pub async fn run_stream(
        &self,
        unit_id: &str,
        unit: Arc<dyn FlowUnit>,
        mut ctx: DataContext,
        tx: mpsc::Sender<OutputBatch>,
    ) -> Result<StreamReport> {
        let metrics = ctx.statistics().clone();
        self.collector.register(unit_id, metrics.clone());

        let mut report = StreamReport {
            unit_id: unit_id.to_string(),
            outcome: StreamOutcome::Finished(StatusCode::Ok),
            invocations: 0,
            batches: 0,
        };

        let pre = {
            let _permit = self.semaphore.acquire().await
                .context("Executor semaphore closed")?;
            unit.data_pre(&mut ctx).await
        };
        info!(unit = unit_id, status = ?pre, "stream opened");

        let outcome = match pre {
            Err(e) => {
                metrics.record_error();
                Err(e)
            }
            Ok(_) => self.drive(unit_id, unit.as_ref(), &mut ctx, &tx, &mut report).await?,
        };

        report.outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => self.apply_policy(unit_id, e, &ctx, &tx, &mut report).await?,
        };

        {
            let _permit = self.semaphore.acquire().await
                .context("Executor semaphore closed")?;
            if let Err(e) = unit.data_post(&mut ctx).await {
                warn!(unit = unit_id, error = %e, "data_post failed");
            }
        }
        self.flush(unit_id, &mut ctx, &tx, &mut report).await?;

        info!(
            unit = unit_id,
            outcome = ?report.outcome,
            invocations = report.invocations,
            "stream closed"
        );
        Ok(report)
    }

    async fn drive(
        &self,
        unit_id: &str,
        unit: &dyn FlowUnit,
        ctx: &mut DataContext,
        tx: &mpsc::Sender<OutputBatch>,
        report: &mut StreamReport,
    ) -> Result<std::result::Result<StreamOutcome, FlowError>> {
        let metrics = ctx.statistics().clone();

        loop {
            let status = {
                let _permit = self.semaphore.acquire().await
                    .context("Executor semaphore closed")?;
                let start = metrics.start_processing();
                let status = unit.process(ctx).await;
                metrics.finish_processing(start);
                status
            };
            report.invocations += 1;
            self.flush(unit_id, ctx, tx, report).await?;

            match status {
                Ok(StatusCode::Continue) => {
                    if ctx.wait_event(self.event_timeout).await.is_none() {
                        warn!(unit = unit_id, "no event before timeout");
                        return Ok(Ok(StreamOutcome::TimedOut));
                    }
                }
                Ok(status) if status.is_error() => {
                    metrics.record_error();
                    return Ok(Err(FlowError::new(status, "process returned an error status")));
                }
                Ok(status) => return Ok(Ok(StreamOutcome::Finished(status))),
                Err(e) => {
                    metrics.record_error();
                    return Ok(Err(e));
                }
            }
        }
    }

    async fn apply_policy(
        &self,
        unit_id: &str,
        error: FlowError,
        ctx: &DataContext,
        tx: &mpsc::Sender<OutputBatch>,
        report: &mut StreamReport,
    ) -> Result<StreamOutcome> {
        match self.error_policy {
            ErrorPolicy::Propagate => {
                warn!(unit = unit_id, error = %error, "stream failed");
                Ok(StreamOutcome::Failed(error))
            }
            ErrorPolicy::SkipItem => {
                debug!(unit = unit_id, error = %error, "error skipped");
                Ok(StreamOutcome::Absorbed(error))
            }
            ErrorPolicy::MarkError => {
                let mut errored = Buffer::new(ctx.device().clone());
                errored.set_error(error.clone());
                let mut buffers = BufferList::new(ctx.device().clone());
                buffers.push_back(errored);

                self.send(tx, unit_id, ERROR_PORT, buffers, report).await?;
                Ok(StreamOutcome::Absorbed(error))
            }
        }
    }

    async fn flush(
        &self,
        unit_id: &str,
        ctx: &mut DataContext,
        tx: &mpsc::Sender<OutputBatch>,
        report: &mut StreamReport,
    ) -> Result<()> {
        let mut outputs: Vec<_> = ctx
            .take_outputs()
            .into_iter()
            .filter(|(_, buffers)| !buffers.is_empty())
            .collect();
        outputs.sort_by(|a, b| a.0.cmp(&b.0));

        for (port, buffers) in outputs {
            ctx.statistics().record_items(buffers.len() as u64);
            self.send(tx, unit_id, &port, buffers, report).await?;
        }
        Ok(())
    }

    async fn send(
        &self,
        tx: &mpsc::Sender<OutputBatch>,
        unit_id: &str,
        port: &str,
        buffers: BufferList,
        report: &mut StreamReport,
    ) -> Result<()> {
        let batch = OutputBatch {
            unit_id: unit_id.to_string(),
            port: port.to_string(),
            sequence: report.batches,
            buffers,
        };
        report.batches += 1;
        tx.send(batch).await
            .map_err(|_| anyhow::anyhow!("Output channel of {} closed", unit_id))
    }
}
