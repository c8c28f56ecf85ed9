//! Hand-off from an export source to an external sink
//!
//! The [`SinkDriver`] owns the consumer side of one source: it polls a block,
//! offers it to the [`ExportSink`] until the sink accepts it, then
//! acknowledges the block so the source releases it and forwards the
//! acknowledgement to the other replicas. How a sink talks to its external
//! system is up to the sink.

use crate::error::Result;
use crate::source::{ExportBlock, PollResult, SourceHandle};
use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Destination of exported rows
#[async_trait]
pub trait ExportSink: Send {
    /// Deliver the rows of `block` from `first_unreleased_seq` on. The block
    /// is acknowledged once this returns `Ok`.
    async fn deliver(&mut self, block: &ExportBlock) -> Result<()>;

    /// The source drained after its table left the catalog, or shut down
    async fn end_of_stream(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Counters of a finished driver run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DriverSummary {
    pub blocks: u64,
    pub rows: u64,
    pub retries: u64,
}

/// Poll, deliver, acknowledge loop for one source
pub struct SinkDriver<S> {
    handle: SourceHandle,
    sink: S,
    retry_backoff: Duration,
}

impl<S: ExportSink + 'static> SinkDriver<S> {
    pub fn new(handle: SourceHandle, sink: S) -> Self {
        Self {
            handle,
            sink,
            retry_backoff: Duration::from_millis(100),
        }
    }

    /// Delay before offering a rejected block again
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Run until the source reports end of stream or shuts down
    pub async fn run(mut self) -> Result<DriverSummary> {
        let mut summary = DriverSummary::default();
        loop {
            let block = match self.handle.poll().await {
                Ok(PollResult::Block(block)) => block,
                Ok(PollResult::EndOfStream) => {
                    self.sink.end_of_stream().await?;
                    break;
                }
                Err(e) if e.is_shutdown() => break,
                Err(e) => return Err(e),
            };

            // A polled block is never handed out again, so keep offering it
            while let Err(e) = self.sink.deliver(&block).await {
                if self.handle.is_closed() {
                    debug!(
                        partition = self.handle.partition(),
                        start_seq = block.start_seq(),
                        "Source closed while sink was failing"
                    );
                    return Ok(summary);
                }
                summary.retries += 1;
                warn!(
                    partition = self.handle.partition(),
                    signature = self.handle.signature(),
                    start_seq = block.start_seq(),
                    error = %e,
                    "Sink rejected block, retrying"
                );
                tokio::time::sleep(self.retry_backoff).await;
            }

            summary.blocks += 1;
            summary.rows += block.last_seq() + 1 - block.first_unreleased_seq();
            match self.handle.ack(block.committed_seq(), block.last_seq()) {
                Ok(()) => {}
                Err(e) if e.is_shutdown() => break,
                Err(e) => return Err(e),
            }
        }
        debug!(
            partition = self.handle.partition(),
            signature = self.handle.signature(),
            blocks = summary.blocks,
            rows = summary.rows,
            "Sink driver finished"
        );
        Ok(summary)
    }

    /// Run on the current tokio runtime
    pub fn spawn(self) -> JoinHandle<Result<DriverSummary>> {
        tokio::spawn(self.run())
    }
}
