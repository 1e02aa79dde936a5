pub mod app_config;
pub mod host;
pub mod language_worker;
pub mod logging;

pub use app_config::*;
pub use host::*;
pub use language_worker::*;
pub use logging::*;
