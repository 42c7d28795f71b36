pub mod bootstrap;
pub mod hub;
pub mod session;

pub use hub::{spawn_hub, BoardSnapshot, Hub, HubCommand, HubError, HubHandle, HubStats};
pub use session::{ConnectionId, Frame};
