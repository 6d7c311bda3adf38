use crate::frame::DEFAULT_MAX_FRAME_BYTES;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_COLLAB_URI: &str = "ws://localhost:8765";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
const APP_DIR_NAME: &str = "nbflow";

const DEFAULT_REFACTOR_PROMPT: &str = "You are reviewing a single notebook cell. Rewrite it to be \
clearer and more idiomatic while keeping its behaviour and public names unchanged. Reply with the \
complete replacement code only, without prose or markdown fences.";
const DEFAULT_TESTS_PROMPT: &str = "Write unit tests for the code in this notebook cell using the \
standard unittest module. Cover edge cases and invalid input. Reply with runnable test code only, \
without prose or markdown fences.";
const DEFAULT_DOCSTRING_PROMPT: &str = "Write a docstring for the function or class in this \
notebook cell following the Google style guide, with a summary line, Args and Returns sections. \
Reply with the docstring text only, without quotes or code.";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub collab_server_uri: String,
    pub kernel: KernelSettings,
    pub collab: CollabSettings,
    pub auto_run_dependents: bool,
    pub chat_model: String,
    pub prompts: Prompts,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KernelSettings {
    /// Program and arguments for the kernel process; empty selects the embedded driver.
    pub command: Vec<String>,
    pub ready_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CollabSettings {
    pub reconnect_delay_secs: u64,
    pub max_message_bytes: usize,
    pub send_queue_capacity: usize,
    pub presence_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Prompts {
    pub refactor: String,
    pub generate_tests: String,
    pub generate_docstring: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            collab_server_uri: DEFAULT_COLLAB_URI.to_string(),
            kernel: KernelSettings::default(),
            collab: CollabSettings::default(),
            auto_run_dependents: true,
            chat_model: String::new(),
            prompts: Prompts::default(),
        }
    }
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            ready_timeout_secs: 60,
            idle_timeout_secs: 5,
            shutdown_timeout_secs: 5,
        }
    }
}

impl KernelSettings {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for CollabSettings {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: 5,
            max_message_bytes: DEFAULT_MAX_FRAME_BYTES,
            send_queue_capacity: 1_024,
            presence_capacity: 64,
        }
    }
}

impl CollabSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            refactor: DEFAULT_REFACTOR_PROMPT.to_string(),
            generate_tests: DEFAULT_TESTS_PROMPT.to_string(),
            generate_docstring: DEFAULT_DOCSTRING_PROMPT.to_string(),
        }
    }
}

impl Prompts {
    fn backfill(&mut self) {
        let defaults = Prompts::default();
        if self.refactor.trim().is_empty() {
            self.refactor = defaults.refactor;
        }
        if self.generate_tests.trim().is_empty() {
            self.generate_tests = defaults.generate_tests;
        }
        if self.generate_docstring.trim().is_empty() {
            self.generate_docstring = defaults.generate_docstring;
        }
    }
}

impl Settings {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
    }

    pub fn try_load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let raw = fs::read_to_string(path)?;
        let mut settings: Settings = serde_json::from_str(&raw)?;
        settings.prompts.backfill();
        Ok(settings)
    }

    /// Loads settings, falling back to defaults when the file is missing or unreadable.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Settings::default();
        }
        match Self::try_load(path) {
            Ok(settings) => settings,
            Err(err) => {
                warn!(event = "settings_load_error", path = %path.display(), error = %err);
                Settings::default()
            }
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SettingsError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(uri) = env_value("NBFLOW_COLLAB_URI") {
            self.collab_server_uri = uri;
        }
        if let Some(command) = env_value("NBFLOW_KERNEL_CMD") {
            let parts = command
                .split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>();
            if !parts.is_empty() {
                self.kernel.command = parts;
            }
        }
        self
    }

    pub fn room_url(&self, notebook_id: &str) -> String {
        format!(
            "{}/rooms/{}",
            self.collab_server_uri.trim_end_matches('/'),
            notebook_id
        )
    }
}

pub fn env_value(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings::load(dir.path().join("absent.json"));
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.collab.max_message_bytes, 10 * 1024 * 1024);
        assert_eq!(settings.kernel.idle_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(SETTINGS_FILE_NAME);
        fs::write(&path, "{ not json").expect("write");
        assert!(Settings::try_load(&path).is_err());
        assert_eq!(Settings::load(&path), Settings::default());
    }

    #[test]
    fn partial_file_keeps_defaults_and_backfills_prompts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(SETTINGS_FILE_NAME);
        fs::write(
            &path,
            r#"{"collab_server_uri":"ws://collab.internal:9000","kernel":{"idle_timeout_secs":2},"prompts":{"refactor":""}}"#,
        )
        .expect("write");

        let settings = Settings::load(&path);
        assert_eq!(settings.collab_server_uri, "ws://collab.internal:9000");
        assert_eq!(settings.kernel.idle_timeout_secs, 2);
        assert_eq!(settings.kernel.ready_timeout_secs, 60);
        assert_eq!(settings.prompts.refactor, Prompts::default().refactor);
        assert!(settings.auto_run_dependents);
    }

    #[test]
    fn save_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cfg").join(SETTINGS_FILE_NAME);
        let mut settings = Settings::default();
        settings.chat_model = "local/coder".to_string();
        settings.collab.reconnect_delay_secs = 1;
        settings.save(&path).expect("save");
        assert_eq!(Settings::try_load(&path).expect("load"), settings);
    }

    #[test]
    fn room_url_joins_base_and_notebook_id() {
        let mut settings = Settings::default();
        settings.collab_server_uri = "ws://localhost:8765/".to_string();
        assert_eq!(settings.room_url("nb-42"), "ws://localhost:8765/rooms/nb-42");
    }
}
