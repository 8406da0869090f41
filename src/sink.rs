use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::Result;
use crate::point::{MeasurementPoint, ScanSummary};

/// Consumer of emitted points. The acquisition core never opens files
/// itself; archive writers live behind this trait.
#[async_trait]
pub trait ResultSink: Send {
    async fn emit(&mut self, point: MeasurementPoint) -> Result<()>;

    /// Called exactly once per scan, also after abort or failure, so
    /// partial results are closed out rather than discarded.
    async fn finalize(&mut self, summary: ScanSummary) -> Result<()>;
}

#[derive(Default)]
struct MemorySinkInner {
    points: Vec<MeasurementPoint>,
    summary: Option<ScanSummary>,
}

/// In-memory sink, shared handle survives the scan for inspection.
#[derive(Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemorySinkInner>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> Vec<MeasurementPoint> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).points.clone()
    }

    pub fn summary(&self) -> Option<ScanSummary> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).summary
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn emit(&mut self, point: MeasurementPoint) -> Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .points
            .push(point);
        Ok(())
    }

    async fn finalize(&mut self, summary: ScanSummary) -> Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .summary
            .replace(summary);
        Ok(())
    }
}
