use crate::services::resources::ResourceLimits;
use anyhow::Result;
use labforge_library::{
    bail_error, bail_typed,
    transaction::TransactionId,
    utils::{file::read_json, port::Port},
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Everything needed to launch one kind of lab environment
pub struct LabTemplate {
    /// Filled in from the key the template is registered under
    #[serde(default)]
    pub profile_id: String,
    /// Image reference, including tag
    pub image: String,
    pub limits: ResourceLimits,
    /// Overrides the image entrypoint when non-empty
    #[serde(default)]
    pub startup_command: Vec<String>,
    /// Executed inside the container; exit code 0 means healthy
    pub health_check_command: Vec<String>,
    /// Port the IDE or language server listens on inside the container
    pub container_port: Port,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Idle time before the reaper reclaims the lab, overrides the engine default
    #[serde(default)]
    pub idle_timeout_sec: Option<u64>,
    /// Inactivity before a running lab is considered idle, overrides the engine default
    #[serde(default)]
    pub idle_threshold_sec: Option<u64>,
}

impl LabTemplate {
    fn validate(&self, tid: &TransactionId) -> Result<()> {
        if self.image.is_empty() {
            bail_error!(tid=tid, profile=%self.profile_id, "Template is missing an image");
        }
        if self.health_check_command.is_empty() {
            bail_error!(tid=tid, profile=%self.profile_id, "Template is missing a health check command");
        }
        if self.limits.cpu_shares == 0 || self.limits.memory_bytes == 0 {
            bail_error!(tid=tid, profile=%self.profile_id, "Template resource limits must be non-zero");
        }
        if self.container_port == 0 {
            bail_error!(tid=tid, profile=%self.profile_id, "Template container port must be non-zero");
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct UnknownProfileError {
    pub profile_id: String,
}
impl std::fmt::Display for UnknownProfileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "Unknown lab profile '{}'", self.profile_id)
    }
}
impl std::error::Error for UnknownProfileError {}

type TemplateMap = Arc<HashMap<String, Arc<LabTemplate>>>;

/// Profile id to [LabTemplate] lookup.
/// Reloads replace the whole map at once, so a lookup never sees a half-applied reload.
pub struct TemplateRegistry {
    templates: RwLock<TemplateMap>,
    /// Templates from the engine configuration, always present under any from the file
    base: HashMap<String, LabTemplate>,
    source_file: Option<String>,
}

impl TemplateRegistry {
    pub fn boxed(
        templates: &HashMap<String, LabTemplate>,
        source_file: Option<String>,
        tid: &TransactionId,
    ) -> Result<Arc<Self>> {
        let map = Self::build(templates, tid)?;
        info!(tid=tid, profiles=?map.keys().collect::<Vec<_>>(), "Loaded lab templates");
        Ok(Arc::new(TemplateRegistry {
            templates: RwLock::new(map),
            base: templates.clone(),
            source_file,
        }))
    }

    fn build(templates: &HashMap<String, LabTemplate>, tid: &TransactionId) -> Result<TemplateMap> {
        let mut map = HashMap::with_capacity(templates.len());
        for (profile_id, template) in templates {
            let mut template = template.clone();
            template.profile_id = profile_id.clone();
            template.validate(tid)?;
            map.insert(profile_id.clone(), Arc::new(template));
        }
        Ok(Arc::new(map))
    }

    /// # Errors
    /// [UnknownProfileError] if no template is registered for the profile
    pub fn resolve(&self, profile_id: &str, tid: &TransactionId) -> Result<Arc<LabTemplate>> {
        match self.templates.read().get(profile_id) {
            Some(t) => Ok(t.clone()),
            None => bail_typed!(
                UnknownProfileError {
                    profile_id: profile_id.to_string()
                },
                tid = tid,
                profile = profile_id,
                "Lab requested for unknown profile"
            ),
        }
    }

    /// Validate every template, then swap them all in.
    /// On any validation failure the current templates stay in place.
    pub fn reload(&self, templates: &HashMap<String, LabTemplate>, tid: &TransactionId) -> Result<usize> {
        let map = Self::build(templates, tid)?;
        let count = map.len();
        *self.templates.write() = map;
        info!(tid = tid, count = count, "Reloaded lab templates");
        Ok(count)
    }

    /// Reload from the configured templates file, a JSON object of profile id to template.
    /// File templates are layered over the configured ones, replacing any with the same profile id.
    pub fn reload_from_file(&self, tid: &TransactionId) -> Result<usize> {
        let pth = match &self.source_file {
            Some(p) if !p.is_empty() => p,
            _ => bail_error!(tid = tid, "No templates file configured to reload from"),
        };
        debug!(tid=tid, path=%pth, "Reading templates file");
        let from_file: HashMap<String, LabTemplate> = match read_json(pth) {
            Ok(t) => t,
            Err(e) => bail_error!(tid=tid, error=%e, path=%pth, "Failed to read templates file"),
        };
        let mut templates = self.base.clone();
        templates.extend(from_file);
        self.reload(&templates, tid)
    }

    pub fn profiles(&self) -> Vec<String> {
        let mut p: Vec<String> = self.templates.read().keys().cloned().collect();
        p.sort();
        p
    }
}
