pub mod auth;
pub mod config;
pub mod data;
pub mod websocket;
pub mod api;
pub mod client;
