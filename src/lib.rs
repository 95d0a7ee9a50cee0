pub mod config;
pub mod motor;
pub mod transport;
