pub mod ai;
pub mod assistant_memory;
pub mod camera;
pub mod config;
mod config_env;
pub mod engine;
pub mod intent;
pub mod local_state;
pub mod models;
pub mod session;
pub mod speech;
pub mod sync;
pub mod users;
