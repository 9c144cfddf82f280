pub mod browser;
pub mod config;
pub mod detection;
pub mod error;
pub mod persistence;
pub mod rendering;
pub mod species;
pub mod video;

// Callers only need `aviary_core::{CurationError, Result}`
pub use error::{CurationError, Result};
