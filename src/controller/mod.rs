//! Decision loop: classify, optimize, emit, record.

pub mod fallback;
pub mod health;
pub mod mode;
pub mod recorder;
pub mod scheduler;

pub use fallback::fallback_command;
pub use health::{HealthMonitor, HealthStatus};
pub use mode::ModeClassifier;
pub use recorder::{Alert, AlertSeverity, MemorySink, RecordingSink, TracingSink};
pub use scheduler::{Collaborators, DecisionScheduler};
