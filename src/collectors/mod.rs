pub mod host;
pub mod loadavg;
pub mod supervisor;
pub mod types;

pub use loadavg::LoadAvgCollector;
pub use supervisor::SupervisorCollector;
pub use types::*;
