pub mod config;
pub mod db;
pub mod docs;
pub mod handlers;
pub mod models;
pub mod relay;
pub mod routes;
pub mod server;
pub mod store;
pub mod websocket;
pub mod ws;
