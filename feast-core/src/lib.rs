pub mod config;
pub mod error;
pub mod feature_reference;
pub mod feature_store;
pub mod job;
pub mod key_serialization;
pub mod materialization;
pub mod model;
pub mod offline_store;
pub mod onlinestore;
pub mod registry;
pub mod types;
pub mod util;
pub mod writer;

pub use error::{FeastError, Result};
