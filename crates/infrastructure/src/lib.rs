pub mod environment;
pub mod event_bus;
pub mod file_watcher;
pub mod metadata;
pub mod process;

pub use environment::{InMemoryEnvironment, SystemEnvironment};
pub use event_bus::{EventFilter, ScriptEventManager, Subscription};
pub use file_watcher::FileEventSource;
pub use metadata::FileSystemMetadataProvider;
pub use process::{LanguageWorkerProcess, LanguageWorkerProcessFactory};
