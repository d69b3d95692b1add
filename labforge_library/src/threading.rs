use crate::clock::now;
use crate::continuation::{GLOB_CONT_CHECK, GLOB_NOTIFIER};
use crate::transaction::TransactionId;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};
#[cfg(feature = "full_spans")]
use tracing::{Instrument, Span};

/// Hands the constructed service to a background loop that was spawned before it existed.
pub type ServiceSender<S> = oneshot::Sender<Arc<S>>;

/// return time in milliseconds to sleep for
fn sleep_time(call_ms: u64, start_t: Instant) -> u64 {
    std::cmp::max(1, call_ms as i128 - start_t.elapsed().as_millis() as i128) as u64
}

/// Start an async function inside a Tokio task.
/// It will be executed every `call_ms` milliseconds, measured from the start of the previous run.
/// The loop waits until the service is sent on the returned channel.
pub fn tokio_thread<S, T>(
    call_ms: u64,
    tid: TransactionId,
    function: fn(Arc<S>, TransactionId) -> T,
) -> (JoinHandle<()>, ServiceSender<S>)
where
    T: Future<Output = ()> + Send + 'static,
    S: Send + Sync + 'static,
{
    let (tx, rx) = oneshot::channel::<Arc<S>>();
    let td = async move {
        let service: Arc<S> = match rx.await {
            Ok(service) => service,
            Err(e) => {
                error!(tid=tid, error=%e, typename=%std::any::type_name::<S>(), "Tokio service thread failed to receive service from channel!");
                return;
            },
        };
        debug!(tid=tid, typename=%std::any::type_name::<S>(), "Periodic background loop started");
        GLOB_CONT_CHECK.thread_start(&tid);
        while GLOB_CONT_CHECK.check_continue() {
            tracing::trace!(tid = tid, "Executing");
            let start = now();
            function(service.clone(), tid.clone()).await;
            let sleep_t = sleep_time(call_ms, start);
            tracing::trace!(tid = tid, "Completed");
            tokio::select! {
                _ = GLOB_NOTIFIER.notified() => (),
                _ = tokio::time::sleep(Duration::from_millis(sleep_t)) => (),
            }
        }
        GLOB_CONT_CHECK.thread_exit(&tid);
    };
    #[cfg(feature = "full_spans")]
    let td = td.instrument(Span::current());
    (tokio::spawn(td), tx)
}

/// Start an async function inside a Tokio task.
/// It will be executed on each item sent via the returned [UnboundedSender], one item at a time.
pub fn tokio_sender_thread<S, T, R, F>(
    tid: TransactionId,
    function: Arc<F>,
) -> (JoinHandle<()>, ServiceSender<S>, UnboundedSender<T>)
where
    S: Send + Sync + 'static,
    T: Send + Sync + 'static,
    R: Future<Output = ()> + Send,
    F: Fn(Arc<S>, TransactionId, T) -> R + Sync + Send + 'static,
{
    let (service_tx, service_rx) = oneshot::channel::<Arc<S>>();
    let (item_tx, mut item_rx) = tokio::sync::mpsc::unbounded_channel::<T>();
    let td = async move {
        let service: Arc<S> = match service_rx.await {
            Ok(svc) => svc,
            Err(_) => {
                error!(tid=tid, typename=%std::any::type_name::<S>(), "Tokio service thread failed to receive service from channel!");
                return;
            },
        };
        GLOB_CONT_CHECK.thread_start(&tid);
        loop {
            tokio::select! {
              _ = GLOB_NOTIFIER.notified() => break,
              item = item_rx.recv() => match item {
                  Some(item) => {
                        tracing::trace!(tid=tid, "Executing");
                        function(service.clone(), tid.clone(), item).await;
                        tracing::trace!(tid=tid, "Completed");
                    },
                  None => break,
              },
            }
        }
        GLOB_CONT_CHECK.thread_exit(&tid);
    };
    #[cfg(feature = "full_spans")]
    let td = td.instrument(Span::current());
    (tokio::spawn(td), service_tx, item_tx)
}
