pub mod entities;
pub mod events;
pub mod invocation;
pub mod ports;
pub mod rpc;

pub use entities::*;
pub use events::*;
pub use invocation::*;
pub use ports::*;
pub use rpc::*;
pub use funchost_errors::{HostError, HostResult};
