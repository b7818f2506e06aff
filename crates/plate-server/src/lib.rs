pub mod config;
pub mod engine;
pub mod error;
pub mod registry;
pub mod server;
pub mod session;

pub use config::{ConfigError, OriginPolicy, ServerConfig};
pub use engine::{EngineCommand, EngineHandle, RelayEngine};
pub use error::ServerError;
pub use registry::{Membership, RoomRegistry};
pub use server::{build_router, start, ServerHandle};
pub use session::{ConnectionConfig, ConnectionSession, SessionState};
