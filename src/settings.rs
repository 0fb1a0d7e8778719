use std::time::Duration;

use clap::Args;

#[derive(Args, Clone, Debug)]
pub struct Settings {
    /// Only watch this namespace instead of the whole cluster.
    #[arg(long)]
    pub namespace: Option<String>,

    /// Seconds between periodic re-reconciles of a healthy object.
    #[arg(long, default_value_t = 300)]
    pub resync_secs: u64,

    /// Seconds to wait before retrying a failed reconcile.
    #[arg(long, default_value_t = 15)]
    pub error_backoff_secs: u64,
}

impl Settings {
    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: None,
            resync_secs: 300,
            error_backoff_secs: 15,
        }
    }
}
