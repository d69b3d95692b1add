use crate::services::resources::{Allocation, ResourceLimits};
use crate::services::runtime::RuntimeHandle;
use anyhow::Result;
use labforge_library::{bail_typed, transaction::TransactionId, utils::port::Port};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// The uniqueness boundary for labs: at most one live instance per key
pub struct OwnerKey {
    pub student_id: String,
    pub course_id: String,
    pub profile_id: String,
}
impl OwnerKey {
    pub fn new(student_id: &str, course_id: &str, profile_id: &str) -> Self {
        OwnerKey {
            student_id: student_id.to_string(),
            course_id: course_id.to_string(),
            profile_id: profile_id.to_string(),
        }
    }

    /// # Errors
    /// [InvalidOwnerError] naming the first empty field
    pub fn validate(&self, tid: &TransactionId) -> Result<()> {
        for (field, value) in [
            ("student_id", &self.student_id),
            ("course_id", &self.course_id),
            ("profile_id", &self.profile_id),
        ] {
            if value.trim().is_empty() {
                bail_typed!(InvalidOwnerError { field }, tid = tid, field = field, "Rejecting owner key with empty field");
            }
        }
        Ok(())
    }
}
impl std::fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.student_id, self.course_id, self.profile_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LabStatus {
    Requested,
    Provisioning,
    Running,
    Idle,
    Stopping,
    Stopped,
    Failed,
    Destroyed,
}

impl LabStatus {
    pub const ALL: [LabStatus; 8] = [
        LabStatus::Requested,
        LabStatus::Provisioning,
        LabStatus::Running,
        LabStatus::Idle,
        LabStatus::Stopping,
        LabStatus::Stopped,
        LabStatus::Failed,
        LabStatus::Destroyed,
    ];

    /// Counts against the one-live-instance-per-owner rule
    pub fn is_non_terminal(&self) -> bool {
        matches!(
            self,
            LabStatus::Requested | LabStatus::Provisioning | LabStatus::Running | LabStatus::Idle
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LabStatus::Destroyed)
    }

    /// The container is up and reachable at its allocated port
    pub fn has_endpoint(&self) -> bool {
        matches!(self, LabStatus::Running | LabStatus::Idle)
    }

    pub fn can_transition_to(&self, next: LabStatus) -> bool {
        use LabStatus::*;
        match (*self, next) {
            (Requested, Provisioning) => true,
            (Provisioning, Running) => true,
            (Running, Idle) | (Idle, Running) => true,
            (Requested | Provisioning | Running | Idle, Stopping) => true,
            (Stopping, Stopped) => true,
            (Stopped, Destroyed) | (Failed, Destroyed) => true,
            (Requested | Provisioning | Running | Idle | Stopping | Stopped, Failed) => true,
            _ => false,
        }
    }
}
impl std::fmt::Display for LabStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
pub struct InvalidTransitionError {
    pub instance_id: String,
    pub from: LabStatus,
    pub to: LabStatus,
}
impl std::fmt::Display for InvalidTransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "Lab '{}' cannot move from {} to {}", self.instance_id, self.from, self.to)
    }
}
impl std::error::Error for InvalidTransitionError {}

#[derive(Debug)]
pub struct InvalidOwnerError {
    pub field: &'static str,
}
impl std::fmt::Display for InvalidOwnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "Owner key field '{}' must not be empty", self.field)
    }
}
impl std::error::Error for InvalidOwnerError {}

#[derive(Debug)]
pub struct LabNotFoundError {
    pub owner: OwnerKey,
}
impl std::fmt::Display for LabNotFoundError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "No lab found for '{}'", self.owner)
    }
}
impl std::error::Error for LabNotFoundError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// One provisioned per-learner environment, as persisted
pub struct LabInstance {
    pub id: String,
    pub owner: OwnerKey,
    pub status: LabStatus,
    pub runtime_handle: Option<RuntimeHandle>,
    /// Set while the instance holds an [Allocation]
    pub allocated_port: Option<Port>,
    pub resource_limits: ResourceLimits,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_health_check_at: Option<OffsetDateTime>,
    /// Consecutive failed health probes
    pub failure_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub status_changed_at: OffsetDateTime,
    pub failure_reason: Option<String>,
}

impl LabInstance {
    pub fn new(id: String, owner: OwnerKey, limits: ResourceLimits, now: OffsetDateTime) -> Self {
        LabInstance {
            id,
            owner,
            status: LabStatus::Requested,
            runtime_handle: None,
            allocated_port: None,
            resource_limits: limits,
            created_at: now,
            last_active_at: now,
            last_health_check_at: None,
            failure_count: 0,
            status_changed_at: now,
            failure_reason: None,
        }
    }

    pub fn transition(&mut self, next: LabStatus, now: OffsetDateTime) -> Result<()> {
        if !self.status.can_transition_to(next) {
            anyhow::bail!(InvalidTransitionError {
                instance_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.status_changed_at = now;
        Ok(())
    }

    pub fn allocation(&self) -> Option<Allocation> {
        self.allocated_port.map(|port| Allocation {
            port,
            limits: self.resource_limits,
        })
    }

    /// Detach the allocation so it is returned to the allocator exactly once
    pub fn take_allocation(&mut self) -> Option<Allocation> {
        let alloc = self.allocation();
        self.allocated_port = None;
        alloc
    }

    /// The handle to use when removing this instance's container.
    /// Falls back to the deterministic container name when create never reported back.
    pub fn removal_handle(&self) -> RuntimeHandle {
        match &self.runtime_handle {
            Some(h) => h.clone(),
            None => RuntimeHandle::for_instance(&self.id),
        }
    }

    pub fn describe(&self, public_host: &str) -> LabDescriptor {
        let endpoint = match (self.status.has_endpoint(), self.allocated_port) {
            (true, Some(port)) => Some(Endpoint {
                host: public_host.to_string(),
                port,
            }),
            _ => None,
        };
        LabDescriptor {
            instance_id: self.id.clone(),
            owner: self.owner.clone(),
            status: self.status,
            endpoint,
            failure_reason: self.failure_reason.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: Port,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// What callers of the engine see about a lab
pub struct LabDescriptor {
    pub instance_id: String,
    pub owner: OwnerKey,
    pub status: LabStatus,
    /// Present only while Running or Idle
    pub endpoint: Option<Endpoint>,
    pub failure_reason: Option<String>,
}
