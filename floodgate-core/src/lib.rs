#[macro_use]
mod error;
pub use error::{AnyError, AnyResult};

pub mod checker;
pub mod config;
pub mod context;
pub mod discovery;
pub mod dubbo;
pub mod filter;
pub mod registry;
pub mod router;
pub mod upstream;
pub mod worker;
