//! Downstream delivery of merged results.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::EmissionError;
use crate::fragment::MergedResult;

/// Receives merged results from the aggregator.
///
/// Called from inside the owning group's critical section. Returning an
/// error makes the aggregator roll back every group mutation of the
/// submission that produced the result.
#[async_trait]
pub trait MergedResultSink: Send + Sync + 'static {
    /// Deliver one result.
    ///
    /// # Errors
    ///
    /// Returns [`EmissionError`] if the downstream channel rejected the
    /// result.
    async fn emit(&self, result: &MergedResult) -> Result<(), EmissionError>;
}

#[async_trait]
impl<S: MergedResultSink + ?Sized> MergedResultSink for Arc<S> {
    async fn emit(&self, result: &MergedResult) -> Result<(), EmissionError> {
        (**self).emit(result).await
    }
}

/// Sink that forwards results into an unbounded tokio channel.
///
/// # Examples
///
/// ```
/// use message_aggregator::ChannelSink;
///
/// let (sink, mut rx) = ChannelSink::new();
/// assert!(rx.try_recv().is_err());
/// # drop(sink);
/// ```
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<MergedResult>,
}

impl ChannelSink {
    /// Create a sink and the receiver its results arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MergedResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MergedResultSink for ChannelSink {
    async fn emit(&self, result: &MergedResult) -> Result<(), EmissionError> {
        self.tx
            .send(result.clone())
            .map_err(|_| EmissionError::new("merged result receiver was dropped"))
    }
}
