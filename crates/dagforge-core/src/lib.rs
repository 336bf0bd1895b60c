pub mod agents;
pub mod cancellation;
pub mod config;
pub mod event_bus;
pub mod repository;

pub const DEFAULT_ENGINE_HOST: &str = "127.0.0.1";
pub const DEFAULT_ENGINE_PORT: u16 = 4287;

pub use agents::*;
pub use cancellation::*;
pub use config::*;
pub use event_bus::*;
pub use repository::*;
