pub mod app;

pub use app::config::DriverConfig;
pub use app::device::{Device, RunGuard};
pub use app::error::{AppError, Result};
