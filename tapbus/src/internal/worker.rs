use std::sync::Weak;

use futures_util::StreamExt;
use tokio::{select, sync::mpsc::Receiver};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::pipeline::PipelineInner;

/// Intake worker of one pipeline.
///
/// Drains screened payloads and classifies them until the pipeline is
/// destroyed or dropped. Holds the pipeline only weakly between payloads.
pub(crate) async fn run(
    receiver: Receiver<String>,
    pipeline: Weak<PipelineInner>,
    cancel_token: CancellationToken,
) {
    let mut payloads = ReceiverStream::new(receiver);
    loop {
        select! {
            biased;
            _ = cancel_token.cancelled() => break,
            raw = payloads.next() => {
                let Some(raw) = raw else { break };
                let Some(pipeline) = pipeline.upgrade() else { break };
                pipeline.classify(&raw);
            }
        }
    }
    tracing::trace!("intake worker stopped");
}
