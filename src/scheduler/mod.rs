//! Background schedulers

mod maintenance;

pub use maintenance::{MaintenanceSchedule, MaintenanceScheduler, MaintenanceStatus, MaintenanceTask};
