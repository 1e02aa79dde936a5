//! 核心依赖的外部协作方接口

pub mod environment;
pub mod metadata;
pub mod process;
pub mod standby;

pub use environment::*;
pub use metadata::*;
pub use process::*;
pub use standby::*;
