pub mod app_config;
pub mod database;
pub mod deployment;
pub mod logging;
pub mod ssh;
pub mod worker;

pub use app_config::*;
pub use database::*;
pub use deployment::*;
pub use logging::*;
pub use ssh::*;
pub use worker::*;
