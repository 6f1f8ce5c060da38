pub mod commands;
pub mod http;
pub mod signature;
pub mod subsystems;
