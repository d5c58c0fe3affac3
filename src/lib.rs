pub mod cancel;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod format;
pub mod fragment;
pub mod generation;
pub mod llm;
pub mod logging;
pub mod service;
pub mod sql_scan;
pub mod validator;

pub use error::{QueryBuilderError, Result};
