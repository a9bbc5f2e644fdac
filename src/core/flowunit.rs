use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Configuration, DataContext, Result, StatusCode};

/// How the runtime drives a flow unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    /// One `process` call per input batch
    #[default]
    Normal,
    /// `process` is invoked repeatedly for one stream until it finishes
    Stream,
}

/// Lifecycle implemented by every processing node
///
/// `open` runs once before the unit is shared; the per-stream calls run
/// `data_pre`, then `process` until it stops asking for continuation, then
/// `data_post`. A single call never blocks waiting for data.
#[async_trait]
pub trait FlowUnit: Send + Sync {
    async fn open(&mut self, config: &Configuration) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn data_pre(&self, _ctx: &mut DataContext) -> Result<StatusCode> {
        Ok(StatusCode::Ok)
    }

    /// `Continue` asks for another invocation once an event arrives
    async fn process(&self, ctx: &mut DataContext) -> Result<StatusCode>;

    async fn data_post(&self, _ctx: &mut DataContext) -> Result<StatusCode> {
        Ok(StatusCode::Ok)
    }

    fn flow_type(&self) -> FlowType {
        FlowType::Normal
    }
}
