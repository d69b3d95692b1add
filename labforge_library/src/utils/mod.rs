pub mod file_utils;
pub use file_utils as file;
pub mod port_utils;
pub use port_utils as port;

use crate::bail_error;
use crate::transaction::TransactionId;
use crate::utils::port::Port;
use anyhow::Result;
use std::time::Duration;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{error, info};

pub fn format_uri(address: &str, port: Port, path: &str) -> String {
    format!("http://{}:{}/{}", address, port, path.trim_start_matches('/'))
}

/// Waits for an expected exit signal from the OS
/// Any of these: sigint, sig_term, sig_usr1, sig_usr2, sig_quit
/// Notifies [static@crate::continuation::GLOB_CONT_CHECK] of the impending exit
pub async fn wait_for_exit_signal(tid: &TransactionId) -> Result<()> {
    let mut sig_int = try_create_signal(tid, SignalKind::interrupt())?;
    let mut sig_term = try_create_signal(tid, SignalKind::terminate())?;
    let mut sig_usr1 = try_create_signal(tid, SignalKind::user_defined1())?;
    let mut sig_usr2 = try_create_signal(tid, SignalKind::user_defined2())?;
    let mut sig_quit = try_create_signal(tid, SignalKind::quit())?;

    info!(tid = tid, "Waiting on exit signal");
    if tokio::select! {
      res = sig_int.recv() => res,
      res = sig_term.recv() => res,
      res = sig_usr1.recv() => res,
      res = sig_usr2.recv() => res,
      res = sig_quit.recv() => res,
    }
    .is_none()
    {
        error!(
            tid = tid,
            "Unknown failure waiting on exit signal. Stream broken. Exiting."
        );
    }
    crate::continuation::GLOB_CONT_CHECK
        .signal_application_exit(Duration::from_secs(30), tid)
        .await;
    Ok(())
}
fn try_create_signal(tid: &TransactionId, kind: SignalKind) -> Result<Signal> {
    match signal(kind) {
        Ok(s) => Ok(s),
        Err(e) => {
            bail_error!(error=%e, tid=tid, kind=kind.as_raw_value(), "Failed to create signal")
        },
    }
}

/// Returns the default if the option is missing or is zero
/// Otherwise returns the given
pub fn missing_or_zero_default<T: num_traits::PrimInt>(opt: &Option<T>, default: T) -> T {
    if let Some(i) = opt {
        if i == &T::zero() {
            return default;
        }
        return *i;
    }
    default
}

/// Delay before retry number `attempt` (zero based): `base_ms * 2^attempt`, capped at `max_ms`.
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
    Duration::from_millis(std::cmp::min(base_ms.saturating_mul(factor), max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("localhost", 8080, "labs", "http://localhost:8080/labs")]
    #[case("localhost", 8081, "/labs/status", "http://localhost:8081/labs/status")]
    #[case("0.0.0.0", 8080, "", "http://0.0.0.0:8080/")]
    fn format_correctly(#[case] addr: &str, #[case] port: Port, #[case] path: &str, #[case] expected: &str) {
        assert_eq!(expected, format_uri(addr, port, path));
    }

    #[rstest]
    #[case(0, 100)]
    #[case(1, 200)]
    #[case(2, 400)]
    #[case(3, 800)]
    #[case(4, 1000)]
    #[case(40, 1000)]
    fn backoff_doubles_and_caps(#[case] attempt: u32, #[case] expected_ms: u64) {
        assert_eq!(backoff_delay(attempt, 100, 1000), Duration::from_millis(expected_ms));
    }
}
