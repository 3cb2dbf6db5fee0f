use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the agent serves, e.g. "https://digame.app". Responses from any
  /// other origin are never cached.
  pub origin: String,

  /// Version tag of the cache generation this build provisions.
  pub cache_version: String,

  #[serde(default = "default_cache_prefix")]
  pub cache_prefix: String,

  /// Resources precached at install time, relative to the origin.
  /// Must include the offline fallback document.
  pub precache: Vec<String>,

  #[serde(default = "default_offline_fallback")]
  pub offline_fallback: String,

  /// Route opened when a clicked notification carries no URL.
  #[serde(default = "default_route")]
  pub default_route: String,

  /// Seconds between periodic sync triggers.
  #[serde(default = "default_sync_interval")]
  pub sync_interval_secs: u64,

  /// Override for the databases and log directory.
  #[serde(default)]
  pub data_dir: Option<PathBuf>,
}

fn default_cache_prefix() -> String {
  "digame-cache".to_string()
}

fn default_offline_fallback() -> String {
  "/offline.html".to_string()
}

fn default_route() -> String {
  "/".to_string()
}

fn default_sync_interval() -> u64 {
  300
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./digame-agent.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/digame-agent/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/digame-agent/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("digame-agent.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("digame-agent").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Name of the cache generation this configuration provisions.
  pub fn generation_name(&self) -> String {
    format!("{}-{}", self.cache_prefix, self.cache_version)
  }

  /// Resolve a possibly-relative resource path against the origin.
  pub fn resolve_url(&self, path: &str) -> Result<String> {
    let origin =
      Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))?;
    let resolved = origin
      .join(path)
      .map_err(|e| eyre!("Invalid resource path {}: {}", path, e))?;
    Ok(resolved.to_string())
  }

  /// The precache manifest as absolute URLs, in configured order.
  pub fn manifest_urls(&self) -> Result<Vec<String>> {
    self.precache.iter().map(|p| self.resolve_url(p)).collect()
  }

  /// Directory holding the databases and logs.
  pub fn resolve_data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("digame-agent"))
  }
}
