mod detector;
mod handlers;
pub mod rules;

pub use detector::{DetectorStats, EventDetector};
pub use handlers::EventHandler;
pub use rules::{FallSignals, RuleConfig};
