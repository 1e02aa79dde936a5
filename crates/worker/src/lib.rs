pub mod capabilities;
pub mod channel;
pub mod debounce;
pub mod manager;
pub mod state;

#[cfg(test)]
mod channel_test;

#[cfg(test)]
mod manager_test;

pub use capabilities::Capabilities;
pub use channel::{ChannelSettings, LanguageWorkerChannel, LoadCompletion};
pub use debounce::FileChangeDebouncer;
pub use manager::LanguageWorkerChannelManager;
pub use state::ChannelState;
