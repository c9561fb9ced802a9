use envconfig::Envconfig;
use std::time::Duration;

#[derive(Envconfig, Clone, Debug)]
pub struct EngineConfig {
    /// Field manager name used for server-side apply.
    /// Env: ROLLOUT_FIELD_MANAGER
    #[envconfig(from = "ROLLOUT_FIELD_MANAGER", default = "rollout-engine")]
    pub field_manager: String,

    /// Steady-state poll interval in seconds.
    /// Env: ROLLOUT_POLL_INTERVAL_SECS
    #[envconfig(from = "ROLLOUT_POLL_INTERVAL_SECS", default = "5")]
    pub poll_interval_secs: u64,

    /// Fallback steady-state budget when the request carries no timeout.
    /// Env: ROLLOUT_DEFAULT_TIMEOUT_MINUTES
    #[envconfig(from = "ROLLOUT_DEFAULT_TIMEOUT_MINUTES", default = "10")]
    pub default_timeout_minutes: u64,

    /// Budget for the readiness recheck of already-running old revisions
    /// during downsizing. Short on purpose: an old revision is either
    /// already steady or it is unhealthy.
    /// Env: ROLLOUT_HEALTHCHECK_TIMEOUT_SECS
    #[envconfig(from = "ROLLOUT_HEALTHCHECK_TIMEOUT_SECS", default = "60")]
    pub healthcheck_timeout_secs: u64,

    /// Request file read by the binary.
    /// Env: ROLLOUT_REQUEST_FILE
    #[envconfig(from = "ROLLOUT_REQUEST_FILE", default = "rollout.yaml")]
    pub request_file: String,
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn healthcheck_timeout(&self) -> Duration {
        Duration::from_secs(self.healthcheck_timeout_secs)
    }

    pub fn step_timeout(&self, request_minutes: u64) -> Duration {
        let minutes = if request_minutes == 0 {
            self.default_timeout_minutes
        } else {
            request_minutes
        };
        Duration::from_secs(minutes * 60)
    }
}
