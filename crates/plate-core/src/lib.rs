pub mod code;
pub mod errors;
pub mod ids;
pub mod protocol;

pub use code::PairingCode;
pub use errors::ProtocolError;
pub use ids::ConnectionId;
pub use protocol::{ClientMessage, EndSessionRequest, JoinRequest, Role, SelectRequest, ServerEvent};
