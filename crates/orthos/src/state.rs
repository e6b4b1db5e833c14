//! Application state shared across HTTP handlers

use std::sync::Arc;

use crate::config::Mode;
use crate::fleet::Fleet;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub fleet: Arc<dyn Fleet>,
    pub mode: Mode,
}

impl AppState {
    #[must_use]
    pub fn new(fleet: Arc<dyn Fleet>, mode: Mode) -> Self {
        Self { fleet, mode }
    }
}
