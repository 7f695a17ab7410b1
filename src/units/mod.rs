//! Unit definitions and unit file loading
//!
//! A unit file is a compose-style YAML document with a `services:` mapping.
//! Each entry becomes one [`ServiceSpec`].

mod parser;
mod service;

pub use parser::{load_unit_file, parse_unit_str, UnitFileError};
pub use service::*;
