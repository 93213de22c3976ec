//! Configuration
//!
//! Service settings, shared wire types and startup validation.

pub mod settings;
pub mod types;
pub mod validator;
