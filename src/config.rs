use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub extensions_dir: PathBuf,
    pub lifecycle: LifecycleConfig,
    pub bridge: BridgeConfig,
    pub challenge: ChallengeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Idle time after which an unpinned instance is reclaimed.
    pub idle_timeout_secs: u64,
    /// How often the reclamation pass runs.
    pub reclaim_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub server_fetch_timeout_ms: u64,
    pub server_fetch_poll_ms: u64,
    pub browser_fetch_timeout_ms: u64,
    pub browser_fetch_poll_ms: u64,
    pub session_timeout_ms: u64,
    pub session_poll_ms: u64,
    /// One-second polls a rendered fetch waits for a challenge to clear.
    pub browser_settle_polls: u32,
    /// Timeout for a single HTTP request made by the host.
    pub request_timeout_secs: u64,
    pub user_agent: String,
    /// Treat a 403/503 as a challenge only when a known provider sent it.
    /// Off by default: any 403/503 triggers a solve and one retry.
    pub require_provider_headers: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    pub solve_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Window in which repeated solve requests for one URL collapse into one.
    pub debounce_secs: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            extensions_dir: default_extensions_dir(),
            lifecycle: LifecycleConfig::default(),
            bridge: BridgeConfig::default(),
            challenge: ChallengeConfig::default(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            reclaim_interval_secs: 60,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server_fetch_timeout_ms: 15_000,
            server_fetch_poll_ms: 50,
            browser_fetch_timeout_ms: 35_000,
            browser_fetch_poll_ms: 100,
            session_timeout_ms: 180_000,
            session_poll_ms: 500,
            browser_settle_polls: 90,
            request_timeout_secs: 30,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"
                .to_string(),
            require_provider_headers: false,
        }
    }
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            solve_timeout_secs: 120,
            poll_interval_ms: 1_000,
            debounce_secs: 5,
        }
    }
}

fn default_extensions_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("mangyomi").join("extensions"))
        .unwrap_or_else(|| PathBuf::from("~/.mangyomi/extensions"))
}

impl LifecycleConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }
}

impl BridgeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ChallengeConfig {
    pub fn solve_timeout(&self) -> Duration {
        Duration::from_secs(self.solve_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }
}

impl SandboxConfig {
    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .map(|h| h.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
            })
            .join("mangyomi")
            .join("sandbox.toml")
    }

    /// Load config from the default path, or return defaults if not found
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load config from a file, falling back to defaults on any error
    pub fn load_from(path: &Path) -> Self {
        let mut config = if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to parse sandbox config");
                        Self::default()
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to read sandbox config");
                    Self::default()
                }
            }
        } else {
            Self::default()
        };

        config.validate();
        config
    }

    /// Validate and clamp config values to acceptable ranges
    fn validate(&mut self) {
        let bridge = &mut self.bridge;
        bridge.server_fetch_poll_ms = bridge.server_fetch_poll_ms.clamp(10, 1_000);
        bridge.browser_fetch_poll_ms = bridge.browser_fetch_poll_ms.clamp(10, 1_000);
        bridge.session_poll_ms = bridge.session_poll_ms.clamp(10, 5_000);

        // A timeout shorter than one poll would never observe a response
        bridge.server_fetch_timeout_ms = bridge.server_fetch_timeout_ms.max(bridge.server_fetch_poll_ms);
        bridge.browser_fetch_timeout_ms =
            bridge.browser_fetch_timeout_ms.max(bridge.browser_fetch_poll_ms);
        bridge.session_timeout_ms = bridge.session_timeout_ms.max(bridge.session_poll_ms);

        bridge.browser_settle_polls = bridge.browser_settle_polls.clamp(1, 600);
        bridge.request_timeout_secs = bridge.request_timeout_secs.clamp(1, 300);

        self.lifecycle.reclaim_interval_secs = self.lifecycle.reclaim_interval_secs.clamp(1, 3_600);

        self.challenge.solve_timeout_secs = self.challenge.solve_timeout_secs.clamp(5, 1_800);
        self.challenge.poll_interval_ms = self.challenge.poll_interval_ms.clamp(50, 10_000);
    }

    /// Save config to file
    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        fs::write(path, content).map_err(|e| format!("Failed to write config: {}", e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_bridge_contract() {
        let config = SandboxConfig::default();
        assert_eq!(config.bridge.server_fetch_timeout_ms, 15_000);
        assert_eq!(config.bridge.server_fetch_poll_ms, 50);
        assert_eq!(config.bridge.browser_fetch_timeout_ms, 35_000);
        assert_eq!(config.bridge.browser_fetch_poll_ms, 100);
        assert_eq!(config.bridge.session_timeout_ms, 180_000);
        assert_eq!(config.bridge.browser_settle_polls, 90);
        assert!(!config.bridge.require_provider_headers);
        assert_eq!(config.challenge.solve_timeout(), Duration::from_secs(120));
        assert_eq!(config.challenge.debounce_window(), Duration::from_secs(5));
        assert_eq!(config.lifecycle.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.lifecycle.reclaim_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("sandbox.toml");
        fs::write(
            &path,
            "[lifecycle]\nidle_timeout_secs = 42\n\n[bridge]\nserver_fetch_poll_ms = 1\n",
        )
        .unwrap();

        let config = SandboxConfig::load_from(&path);
        assert_eq!(config.lifecycle.idle_timeout_secs, 42);
        assert_eq!(config.lifecycle.reclaim_interval_secs, 60);
        // Clamped
        assert_eq!(config.bridge.server_fetch_poll_ms, 10);
        assert_eq!(config.challenge.debounce_secs, 5);
    }

    #[test]
    fn test_broken_file_falls_back() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("sandbox.toml");
        fs::write(&path, "lifecycle = [").unwrap();
        assert_eq!(SandboxConfig::load_from(&path), SandboxConfig::default());
    }

    #[test]
    fn test_save_and_reload() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("sandbox.toml");

        let mut config = SandboxConfig::default();
        config.challenge.debounce_secs = 9;
        config.save_to(&path).unwrap();

        assert_eq!(SandboxConfig::load_from(&path), config);
    }
}
