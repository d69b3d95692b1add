use guid_create::GUID;

/// Correlation id attached to every log line of one logical operation.
pub type TransactionId = String;

pub fn gen_tid() -> TransactionId {
    GUID::rand().to_string().to_lowercase().replace('-', "")
}

lazy_static::lazy_static! {
  pub static ref STARTUP_TID: TransactionId = "Startup".to_string();
  pub static ref CLEAN_TID: TransactionId = "Clean".to_string();
  pub static ref TEST_TID: TransactionId = "TestTest".to_string();
  pub static ref HEALTH_MONITOR_TID: TransactionId = "HealthMonitor".to_string();
  pub static ref IDLE_REAPER_TID: TransactionId = "IdleReaper".to_string();
  pub static ref TEARDOWN_WORKER_TID: TransactionId = "LabTeardown".to_string();
  pub static ref RECOVERY_TID: TransactionId = "Recovery".to_string();
}
