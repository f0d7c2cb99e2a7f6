#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod artifacts;
pub mod constants;
pub mod hardening;
pub mod health;
pub mod logging;
pub mod main_helper;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod specs;
pub mod str_utils;
pub mod token_source;
pub mod types;

pub use types::*;

pub use main_helper::{build_router, AppState, Args};
