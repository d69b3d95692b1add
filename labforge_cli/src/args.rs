use clap::{command, Parser, Subcommand};
use labforge_engine_library::services::instance::OwnerKey;
use labforge_library::utils::port_utils::Port;

#[derive(Parser, Debug)]
/// Identifies one learner's lab
pub struct OwnerArgs {
    #[arg(short, long)]
    pub student: String,
    #[arg(short, long)]
    pub course: String,
    #[arg(long)]
    /// Lab profile, must match a template on the engine
    pub profile: String,
}
impl From<OwnerArgs> for OwnerKey {
    fn from(a: OwnerArgs) -> Self {
        OwnerKey {
            student_id: a.student,
            course_id: a.course,
            profile_id: a.profile,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long)]
    /// Hostname to target
    pub host: String,
    #[arg(short, long)]
    pub port: Port,
    #[command(subcommand)]
    pub command: Commands,
}
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Get a lab for the learner, provisioning one if needed
    Request(OwnerArgs),
    /// Record learner activity, keeping the lab alive
    Activity(OwnerArgs),
    /// Stop and destroy the learner's lab
    Stop(OwnerArgs),
    /// Print the learner's lab status and endpoint
    Status(OwnerArgs),
    /// Print capacity usage and lab counts of the engine
    EngineStatus,
    /// Play table tennis
    Ping,
    /// Have the engine reload templates from its templates file
    ReloadTemplates,
}
