pub mod config;
pub mod engine;
pub mod message;
pub mod metainfo;
pub mod net;
pub mod peer;
pub mod piece;
pub mod scheduler;
pub mod transport;
