pub mod app;
pub mod ard;
pub mod cache;
pub mod config;
pub mod discovery;
pub mod domain;
pub mod download;
pub mod error;
pub mod fs_util;
pub mod lock;
pub mod output;
pub mod plugins;
pub mod pool;
pub mod store;
pub mod transport;
pub mod usage;
