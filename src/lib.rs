//! 函数宿主：Worker通道、占位实例特化与请求分发的组装

pub mod app;
pub mod shutdown;
pub mod standby;

pub use app::Application;
pub use shutdown::ShutdownManager;
pub use standby::HostStandbyManager;
