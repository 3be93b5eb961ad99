use std::path::PathBuf;
use std::time::Duration;

use crate::credit::storage::FileStorage;

/// Predefined configuration presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPreset {
    /// Deployed machines.
    ///
    /// - State directory: `/var/lib/payg`
    /// - Key file: `/usr/local/share/payg/key`
    /// - Rate limit: 10 failed attempts per 30 minutes
    Production,

    /// Test rigs and development machines.
    ///
    /// Same rate limit as production, but state lives under the system
    /// temporary directory so nothing privileged is touched.
    Testing,

    /// Load configuration from environment variables.
    ///
    /// Reads configuration from:
    /// - `PAYG_STATE_DIRECTORY`: directory holding the state records
    /// - `PAYG_KEY_FILE`: path of the shared key
    /// - `PAYG_RATE_LIMIT_ATTEMPTS`: failed attempts allowed per window (default: 10)
    /// - `PAYG_RATE_LIMIT_WINDOW`: window length in seconds (default: 1800)
    /// - `PAYG_COUNT_MALFORMED_ATTEMPTS`: whether malformed codes count (default: true)
    FromEnv,
}

/// Configuration for a credit manager.
///
/// # Environment Variables
///
/// `Default` reads the same variables as [`ConfigPreset::FromEnv`], falling
/// back to the production values.
///
/// # Example
///
/// ```rust
/// use payg::PaygConfig;
/// use std::time::Duration;
///
/// let config = PaygConfig {
///     rate_limit_attempts: 5,
///     rate_limit_window: Duration::from_secs(3600),
///     ..PaygConfig::default()
/// };
/// assert!(config.validate().is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaygConfig {
    /// Directory holding the persisted state records
    pub state_directory: PathBuf,
    /// Path of the shared key; a missing file disables enforcement
    pub key_file: PathBuf,
    /// Failed attempts allowed within `rate_limit_window`; 0 turns limiting off
    pub rate_limit_attempts: usize,
    /// Length of the sliding rate-limit window
    pub rate_limit_window: Duration,
    /// Whether malformed code strings count as failed attempts
    pub count_malformed_attempts: bool,
}

const DEFAULT_STATE_DIRECTORY: &str = "/var/lib/payg";
const DEFAULT_KEY_FILE: &str = "/usr/local/share/payg/key";
const DEFAULT_RATE_LIMIT_ATTEMPTS: usize = 10;
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 30 * 60;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Default for PaygConfig {
    fn default() -> Self {
        Self {
            state_directory: std::env::var_os("PAYG_STATE_DIRECTORY")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIRECTORY)),
            key_file: std::env::var_os("PAYG_KEY_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_FILE)),
            rate_limit_attempts: env_or("PAYG_RATE_LIMIT_ATTEMPTS", DEFAULT_RATE_LIMIT_ATTEMPTS),
            rate_limit_window: Duration::from_secs(env_or(
                "PAYG_RATE_LIMIT_WINDOW",
                DEFAULT_RATE_LIMIT_WINDOW_SECS,
            )),
            count_malformed_attempts: env_or("PAYG_COUNT_MALFORMED_ATTEMPTS", true),
        }
    }
}

impl PaygConfig {
    /// Validates the configuration and returns any warnings.
    ///
    /// # Returns
    ///
    /// A vector of warning messages for potentially problematic settings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.rate_limit_attempts == 0 {
            warnings.push("Rate limiting is disabled; codes can be brute-forced".to_string());
        } else {
            // Compare attempts per second against 10 per 30 minutes
            let window = self.rate_limit_window.as_secs().max(1) as u128;
            let default_window = DEFAULT_RATE_LIMIT_WINDOW_SECS as u128;
            if self.rate_limit_attempts as u128 * default_window
                > DEFAULT_RATE_LIMIT_ATTEMPTS as u128 * window
            {
                warnings.push(
                    "Rate limit is looser than 10 attempts per 30 minutes and weakens brute-force protection"
                        .to_string(),
                );
            }
        }

        if self.rate_limit_window.as_secs() < 60 {
            warnings.push(
                "Very short rate limit window (< 1 minute) makes the limit ineffective".to_string(),
            );
        }

        if self.state_directory.as_os_str().is_empty() {
            warnings.push("State directory is empty; state will be written to the working directory".to_string());
        }

        warnings
    }

    /// A [`FileStorage`] rooted at `state_directory`.
    pub fn file_storage(&self) -> FileStorage {
        FileStorage::new(&self.state_directory)
    }

    /// Returns a summary of the current configuration.
    pub fn summary(&self) -> String {
        format!(
            "PaygConfig {{ State: {}, Key: {}, Rate Limit: {} per {}s, Count Malformed: {} }}",
            self.state_directory.display(),
            self.key_file.display(),
            self.rate_limit_attempts,
            self.rate_limit_window.as_secs(),
            self.count_malformed_attempts,
        )
    }
}

impl From<ConfigPreset> for PaygConfig {
    fn from(preset: ConfigPreset) -> Self {
        match preset {
            ConfigPreset::Production => Self {
                state_directory: PathBuf::from(DEFAULT_STATE_DIRECTORY),
                key_file: PathBuf::from(DEFAULT_KEY_FILE),
                rate_limit_attempts: DEFAULT_RATE_LIMIT_ATTEMPTS,
                rate_limit_window: Duration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECS),
                count_malformed_attempts: true,
            },
            ConfigPreset::Testing => {
                let base = std::env::temp_dir().join("payg");
                Self {
                    state_directory: base.join("state"),
                    key_file: base.join("key"),
                    rate_limit_attempts: DEFAULT_RATE_LIMIT_ATTEMPTS,
                    rate_limit_window: Duration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECS),
                    count_malformed_attempts: true,
                }
            }
            ConfigPreset::FromEnv => Self::default(),
        }
    }
}
