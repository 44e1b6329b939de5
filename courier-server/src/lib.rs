pub mod bridge;
pub mod http;
pub mod subsystems;
