// Declare the modules to re-export
pub mod configs;
pub mod core;

#[cfg(feature = "loggers")]
pub mod loggers;

#[cfg(feature = "gateway")]
pub mod gateway;

// Re-export the pieces every binary needs
pub use configs::{load_config, Config, ConfigArgs, PromotionMode};
pub use core::{FsStore, Hub, HubHandle, MemoryStore};

#[cfg(feature = "loggers")]
pub use loggers::setup_logging;
