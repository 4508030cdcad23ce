pub mod error;
pub mod services;
pub mod types;

pub use error::*;
pub use services::*;
pub use types::*;
