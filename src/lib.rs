pub mod server;
pub mod shared;
