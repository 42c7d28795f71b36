pub mod handler;
pub mod msg_clear_handler;
pub mod msg_draw_handler;
pub mod msg_ping_handler;
pub mod msg_register_handler;
pub mod relay_handler;

pub use handler::websocket_handler;
