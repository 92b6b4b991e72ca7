pub mod config;
pub mod coordination;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod status;
pub mod store;
pub mod util;

pub use error::{Error, Result};
