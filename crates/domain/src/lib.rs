pub mod entities;
pub mod messaging;
pub mod repositories;
pub mod services;
pub mod value_objects;

pub use entities::*;
pub use messaging::*;
pub use repositories::*;
pub use runner_errors::{RunnerError, RunnerResult};
pub use services::*;
pub use value_objects::*;
