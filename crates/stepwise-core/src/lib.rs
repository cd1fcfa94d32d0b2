pub mod config;
pub mod error;
pub mod event;
pub mod object;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, StepwiseError};
pub use event::EventBus;
pub use object::FieldObject;
pub use traits::{BusinessObject, DurationStats};
pub use types::*;
