use log::{info, warn};

/// Component-scoped logger; prefixes each line with the owning component.
#[derive(Debug, Clone)]
pub struct LogManager {
    component: &'static str,
}

impl LogManager {
    pub fn new(component: &'static str) -> Self {
        Self { component }
    }

    pub fn record(&self, message: &str) {
        info!("[{}] {}", self.component, message);
    }

    pub fn anomaly(&self, message: &str) {
        warn!("[{}] {}", self.component, message);
    }

    pub fn component(&self) -> &'static str {
        self.component
    }
}
