use anyhow::Result;
use std::ops::Add;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;

/// Shared handle to a wall clock.
pub type Clock = Arc<dyn WallClock>;

/// Get the current [Instant]
#[inline(always)]
pub fn now() -> Instant {
    // allow here because we want all code to use this method
    #[allow(clippy::disallowed_methods)]
    Instant::now()
}

/// Source of wall-clock timestamps.
/// Lab timestamps (creation, activity, health checks) are all read through one of these,
/// so tests can run against paused Tokio time.
pub trait WallClock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
    /// The current time, RFC 3339 formatted
    fn now_str(&self) -> Result<String> {
        format_time(self.now())
    }
}

pub fn format_time(time: OffsetDateTime) -> Result<String> {
    Ok(time.format(&Rfc3339)?)
}

/// Seconds elapsed between `earlier` and `later`, clamped at zero.
pub fn seconds_between(earlier: OffsetDateTime, later: OffsetDateTime) -> u64 {
    let secs = (later - earlier).whole_seconds();
    if secs < 0 {
        0
    } else {
        secs as u64
    }
}

/// Real UTC time.
pub struct LocalTime {}
impl LocalTime {
    pub fn boxed() -> Clock {
        Arc::new(LocalTime {})
    }
}
impl WallClock for LocalTime {
    fn now(&self) -> OffsetDateTime {
        #[allow(clippy::disallowed_methods)]
        OffsetDateTime::now_utc()
    }
}

/// Wall time derived from the Tokio clock.
/// Starts at the real current time and then advances with [tokio::time], so pausing and advancing
/// Tokio time in tests moves lab timestamps along with it.
pub struct SimulatedTime {
    start_time: OffsetDateTime,
    tokio_elapsed: Instant,
}
impl SimulatedTime {
    pub fn boxed() -> Clock {
        Arc::new(SimulatedTime {
            start_time: LocalTime {}.now(),
            tokio_elapsed: now(),
        })
    }
}
impl WallClock for SimulatedTime {
    fn now(&self) -> OffsetDateTime {
        self.start_time.add(self.tokio_elapsed.elapsed())
    }
}

/// Wrapper for [Clock] to make the logging framework happy.
pub struct ClockWrapper(pub Clock);
impl FormatTime for ClockWrapper {
    #[inline(always)]
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let s = match self.0.now_str() {
            Ok(s) => s,
            Err(e) => {
                println!("time formatting error: {}", e);
                return Err(std::fmt::Error {});
            },
        };
        w.write_str(s.as_str())
    }
}
