//! 请求分发：正常调用管道、占位实例特化以及实例信息

pub mod instance;
pub mod pipeline;
pub mod request;
pub mod specialization;
pub mod trigger;


pub use instance::{ChannelInfo, InstanceInfo, InstanceManager};
pub use pipeline::{render_result, FunctionInvocationPipeline};
pub use request::{HostRequest, HostResponse, RequestHandler};
pub use specialization::{PlaceholderSpecializationHandler, SpecializationState};
pub use trigger::{SpecializationTrigger, SPECIALIZATION_TRIGGER_PATH};
