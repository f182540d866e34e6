pub mod cli;
pub mod config;
pub mod detect;
pub mod monitor;
pub mod notify;
pub mod reconcile;
pub mod report;
pub mod source;
pub mod store;

pub use config::Config;
pub use detect::{Detector, Status, TrackingIndex};
pub use monitor::{AuditRequest, AuditSummary, Monitor};
pub use reconcile::{reconcile, reconcile_recorded, KeyMode, MergePlan, TrackingRow};
pub use source::{CheckpointStore, EntitySource, RestClient};
pub use store::TrackingStore;
