use crate::transaction::TransactionId;
use crate::utils::missing_or_zero_default;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::debug;

pub type TokioRuntime = Arc<Runtime>;

/// Build the multi-threaded runtime the engine runs on.
/// Zero or missing intervals fall back to Tokio's defaults.
pub fn build_tokio_runtime(
    tokio_event_interval: &Option<u32>,
    tokio_queue_interval: &Option<u32>,
    num_threads: &Option<usize>,
    tid: &TransactionId,
) -> anyhow::Result<TokioRuntime> {
    let event = missing_or_zero_default(tokio_event_interval, 61);
    let queue = missing_or_zero_default(tokio_queue_interval, 31);

    let mut rt = tokio::runtime::Builder::new_multi_thread();
    if let Some(n) = num_threads {
        rt.worker_threads(*n);
    }
    let rt = match rt.enable_all().event_interval(event).global_queue_interval(queue).build() {
        Ok(rt) => Arc::new(rt),
        Err(e) => {
            anyhow::bail!(format!("Tokio runtime for main failed to start because: {}", e));
        },
    };
    debug!(
        tid = tid,
        event_interval = event,
        queue_interval = queue,
        "Built tokio runtime"
    );
    Ok(rt)
}
