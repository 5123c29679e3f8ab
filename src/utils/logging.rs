//! `tracing` subscriber setup driven by `LoggingSettings`.

use tracing::Level;

use crate::config::LoggingSettings;

impl LoggingSettings {
    /// The configured level. Unknown names fall back to `INFO`.
    pub fn max_level(&self) -> Level {
        match self.level.trim().to_ascii_lowercase().as_str() {
            "warning" => Level::WARN,
            other => other.parse().unwrap_or(Level::INFO),
        }
    }
}

/// Install the global fmt subscriber. Returns false if one was already
/// installed, which leaves the existing subscriber in place.
pub fn init(settings: &LoggingSettings) -> bool {
    let level = settings.max_level();
    let installed = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(settings.targets)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!("logging at {level}");
    }
    installed
}
