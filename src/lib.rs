pub mod config;
pub mod database_ops;
pub mod models;
pub mod stat_api;
pub mod tracing;
pub mod updater;

pub mod util {
    pub mod env;
}
