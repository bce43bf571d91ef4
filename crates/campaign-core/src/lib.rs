pub mod campaign;
pub mod config;
pub mod events;
pub mod report;
pub mod types;

pub use campaign::CampaignConfig;
pub use config::Config;
pub use events::{EventLog, SafetyEvent, SafetyEventType};
pub use report::{PhaseReport, ReportRow, ReportWriter};
pub use types::*;
