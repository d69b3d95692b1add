pub mod health;
pub mod instance;
pub mod lifecycle;
pub mod reaper;
pub mod registry;
pub mod resources;
pub mod runtime;
pub mod templates;
