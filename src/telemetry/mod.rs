pub mod alerts;
pub mod report;
pub mod snapshot;
