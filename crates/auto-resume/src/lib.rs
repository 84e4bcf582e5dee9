pub mod args;
pub mod config;
pub mod error;
pub mod fsview;
pub mod identity;
pub mod inject;
pub mod logging;
pub mod overrides;
pub mod remote;
pub mod resolve;
pub mod settings;
pub mod target;

pub use error::{Error, Result};
