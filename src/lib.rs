pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod market;
pub mod notify;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{CoreError, MethodError, Result};
