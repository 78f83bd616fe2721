//! Controller tunables.

use std::time::Duration;

/// Default restart budget for runs that stall.
pub const DEFAULT_MAX_RESTARTS: u32 = 5;
/// Default wall-clock bound for one run.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_millis(500);
/// Default bound for gathering every sibling at the rendezvous.
pub const DEFAULT_RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(1);
/// Default cycles each thread waits for its siblings inside the activate command.
pub const DEFAULT_THREAD_WAIT_DELAY: u32 = 100_000;
/// Default attempts for a chunk whose authentication was interrupted.
pub const DEFAULT_AUTH_ATTEMPTS: u32 = 2;

/// Configuration shared by every controller on a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct IfsConfig {
    /// Stalled rounds tolerated before a run is reported as partially complete.
    pub max_restarts: u32,
    /// Wall-clock bound for one run.
    pub run_timeout: Duration,
    /// How long a sibling waits for the others at the rendezvous.
    pub rendezvous_timeout: Duration,
    /// Thread-wait delay placed in activate commands.
    pub thread_wait_delay: u32,
    /// Ask hardware for a machine check on signature failure.
    pub sigmce: bool,
    /// Load as soon as a batch is selected instead of on the next run.
    pub eager_load: bool,
    /// Attempts per chunk when authentication reports an interruption.
    pub auth_attempts: u32,
}

impl Default for IfsConfig {
    fn default() -> Self {
        Self {
            max_restarts: DEFAULT_MAX_RESTARTS,
            run_timeout: DEFAULT_RUN_TIMEOUT,
            rendezvous_timeout: DEFAULT_RENDEZVOUS_TIMEOUT,
            thread_wait_delay: DEFAULT_THREAD_WAIT_DELAY,
            sigmce: false,
            eager_load: false,
            auth_attempts: DEFAULT_AUTH_ATTEMPTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::IfsConfig;

    #[test]
    fn defaults_match_hardware_guidance() {
        let config = IfsConfig::default();
        assert_eq!(config.max_restarts, 5);
        assert_eq!(config.run_timeout, Duration::from_millis(500));
        assert_eq!(config.thread_wait_delay, 100_000);
        assert!(!config.sigmce);
        assert!(!config.eager_load);
        assert_eq!(config.auth_attempts, 2);
    }
}
