//! API route handlers

pub mod error;
pub mod machines;
pub mod system;
pub mod tasks;
pub mod ws;

pub use error::AppError;
