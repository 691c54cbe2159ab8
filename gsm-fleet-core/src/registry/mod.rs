pub mod health;
pub mod module_registry;

pub use health::{HealthMonitor, PollOutcome};
pub use module_registry::{ModuleRegistry, SelectionCriteria};
