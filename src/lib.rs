pub mod config;
pub mod drive;
pub mod geometry;
pub mod hardware;
pub mod messages;
pub mod runtime;
pub mod sensors;
