use crate::config::AppConfig;
use std::path::PathBuf;
use std::sync::Arc;

/// Process-wide state handed to every component.
#[derive(Clone, Debug)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    /// File the configuration was loaded from, passed on to worker processes.
    pub config_path: Option<PathBuf>,
}

impl AppContext {
    pub fn new(config: AppConfig, config_path: Option<PathBuf>) -> Self {
        Self {
            config: Arc::new(config),
            config_path,
        }
    }
}
