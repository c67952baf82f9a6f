pub mod app;

pub use app::adb::connection::{Connection, DeviceEndpoint};
pub use app::adb::controller::AdbController;
pub use app::config::{load_config, AppConfig};
pub use app::error::AppError;
pub use app::monitor::MonitorService;
