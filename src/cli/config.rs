use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::fs;
use tracing::{debug, error, info};

use crate::storage::atomic;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub site: SiteSettings,
    pub accounts: AccountSettings,
    pub browser: BrowserSettings,
    pub job: JobSettings,
    pub storage: StorageSettings,
    pub server: ServerSettings,
}

/// Target site endpoints
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SiteSettings {
    pub login_url: String,
    pub search_url: String,
    pub base_url: String,
}

/// Credentials for the two session roles
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AccountSettings {
    /// Account used to browse and scrape search results
    pub browse: Credentials,
    /// Account whose name applications are submitted under
    pub apply: Credentials,
}

#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.username.trim().is_empty() && !self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .finish()
    }
}

/// WebDriver session settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BrowserSettings {
    pub webdriver_url: String,
    pub headless: bool,
    /// Chrome binary; auto-detected when unset
    pub chrome_binary: Option<String>,
    pub window_size: (u32, u32),
    pub page_load_timeout_secs: u64,
    /// Bounded wait per locator when resolving page elements
    pub match_wait_ms: u64,
    pub behavior: BrowserBehavior,
}

/// Human-like timing
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BrowserBehavior {
    pub click_delay: (u64, u64),  // Min and max delay in milliseconds
    pub typing_speed: (u64, u64), // Min and max milliseconds per character
    pub action_pause_ms: u64,     // Settle time after a navigation click
    pub candidate_delay: (u64, u64), // Min and max pause between applications in milliseconds
}

/// Job execution settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct JobSettings {
    /// Fill forms without submitting and without touching state files
    pub dry_run: bool,
    /// Seconds to wait between cycles
    pub cycle_pause_secs: u64,
    /// Application text; `{street_name}` is replaced by the listing title
    pub message_template: String,
}

/// Where state files live
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
    pub status_file: PathBuf,
    pub seen_file: PathBuf,
}

/// Control surface listener
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

const DEFAULT_MESSAGE: &str = "Beste verhuurder,

Ik zag uw woning aan de {street_name} en ben erg enthousiast. Ik zoek op korte termijn een woning in Den Haag. \
Ik heb een stabiel inkomen, rook niet en heb geen huisdieren. Ik kom graag een keer kijken en ben direct beschikbaar.

Met vriendelijke groet";

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            login_url: "https://www.huurwoningen.nl/account/inloggen-email/?_target_path=/".to_string(),
            search_url: "https://www.huurwoningen.nl/in/den-haag/wijk/zeeheldenkwartier/?price=600-900&radius=1&bedrooms=1".to_string(),
            base_url: "https://www.huurwoningen.nl".to_string(),
        }
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:4444".to_string(),
            headless: true,
            chrome_binary: None,
            window_size: (1920, 1080),
            page_load_timeout_secs: 30,
            match_wait_ms: 3000,
            behavior: BrowserBehavior::default(),
        }
    }
}

impl Default for BrowserBehavior {
    fn default() -> Self {
        Self {
            click_delay: (100, 300),
            typing_speed: (50, 150),
            action_pause_ms: 2000,
            candidate_delay: (2000, 5000),
        }
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            dry_run: false,
            cycle_pause_secs: 0,
            message_template: DEFAULT_MESSAGE.to_string(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            status_file: PathBuf::from("task_status.json"),
            seen_file: PathBuf::from("seen_urls.json"),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

impl StorageSettings {
    pub fn status_path(&self) -> PathBuf {
        self.data_dir.join(&self.status_file)
    }

    /// An absolute seen file is used as is.
    pub fn seen_path(&self) -> PathBuf {
        self.data_dir.join(&self.seen_file)
    }
}

fn env_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

impl AppConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "house-bot", "house-bot") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path
    }

    /// Load the default configuration, then apply environment overrides
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_dir().join("default.yaml");

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_to_file(&config_path)?;
            config
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load an explicit configuration file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let mut config = Self::load_from_file(path)?;
                config.apply_env_overrides();
                Ok(config)
            }
            None => Self::load_default(),
        }
    }

    /// Load configuration from a file
    fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration to a file
    fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        atomic::write_atomic(path, contents.as_bytes())
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply deployment overrides from `lookup` (normally the environment).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("HW_LOGIN_URL") {
            self.site.login_url = v;
        }
        if let Some(v) = lookup("HW_SEARCH_URL") {
            self.site.search_url = v;
        }
        if let Some(v) = lookup("HW_BASE_URL") {
            self.site.base_url = v;
        }

        // Role specific credentials fall back to the shared pair
        let shared_user = lookup("HW_USERNAME");
        let shared_pass = lookup("HW_PASSWORD");
        let accounts = [
            (&mut self.accounts.browse, "HW_BROWSE_USERNAME", "HW_BROWSE_PASSWORD"),
            (&mut self.accounts.apply, "HW_APPLY_USERNAME", "HW_APPLY_PASSWORD"),
        ];
        for (creds, user_key, pass_key) in accounts {
            if let Some(v) = lookup(user_key).or_else(|| shared_user.clone()) {
                creds.username = v;
            }
            if let Some(v) = lookup(pass_key).or_else(|| shared_pass.clone()) {
                creds.password = v;
            }
        }

        if let Some(v) = lookup("HW_DRY_RUN") {
            self.job.dry_run = env_flag(&v);
        }
        if let Some(v) = lookup("HEADLESS") {
            self.browser.headless = env_flag(&v);
        }
        if let Some(v) = lookup("GOOGLE_CHROME_BIN") {
            self.browser.chrome_binary = Some(v);
        }
        if let Some(v) = lookup("WEBDRIVER_URL") {
            self.browser.webdriver_url = v;
        }
        if let Some(v) = lookup("HOUSEBOT_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SEEN_URLS_FILE") {
            self.storage.seen_file = PathBuf::from(v);
        }
        if let Some(port) = lookup("PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
    }
}
