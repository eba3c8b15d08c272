//! `~/.hearth/config.toml` loading and persistence.
//!
//! Every section is optional; accessors on [`HearthConfig`] fill in defaults
//! so callers never deal with partially specified files.
//!
//! ```toml
//! [model]
//! id = "HuggingFaceTB/SmolLM2-1.7B-Instruct"
//! hub_url = "https://huggingface.co"
//! runtime_url = "http://127.0.0.1:8080"
//!
//! [settings]
//! temperature = 0.7
//! top_k = 50
//! access_token = "${HF_TOKEN}"
//!
//! [history]
//! window = 10
//! ```

use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tempfile::NamedTempFile;
use toml_edit::{DocumentMut, Item, Table};

use hearth_context::{DEFAULT_WINDOW, DisplayWindow, Retention};
use hearth_types::{Settings, SettingsDraft};

pub const DEFAULT_MODEL_ID: &str = "HuggingFaceTB/SmolLM2-1.7B-Instruct";
pub const DEFAULT_HUB_URL: &str = "https://huggingface.co";
pub const DEFAULT_RUNTIME_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_MODEL_FILES: &[&str] = &[
    "config.json",
    "generation_config.json",
    "tokenizer.json",
    "tokenizer_config.json",
    "onnx/model_q4f16.onnx",
];
pub const DEFAULT_MAX_NEW_TOKENS: u32 = 1024;

const CONFIG_DIR_NAME: &str = ".hearth";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to edit config at {}: {source}", path.display())]
    Edit {
        path: PathBuf,
        source: toml_edit::TomlError,
    },
    #[error("failed to write config at {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("could not determine the home directory")]
    NoHome,
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Read { path, .. }
            | Self::Parse { path, .. }
            | Self::Edit { path, .. }
            | Self::Write { path, .. } => Some(path),
            Self::NoHome => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HearthConfig {
    pub model: Option<ModelConfig>,
    pub settings: Option<SettingsConfig>,
    pub history: Option<HistoryConfig>,
    pub generation: Option<GenerationConfig>,
    pub cache: Option<CacheConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ModelConfig {
    pub id: Option<String>,
    pub hub_url: Option<String>,
    pub runtime_url: Option<String>,
    /// Artifacts fetched for the model, relative to the repository root.
    pub files: Option<Vec<String>>,
}

#[derive(Default, Deserialize)]
pub struct SettingsConfig {
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub top_k: Option<i64>,
    pub access_token: Option<String>,
}

// Manual Debug impl to keep access tokens out of logs.
impl std::fmt::Debug for SettingsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = if self.access_token.is_some() {
            "[REDACTED]"
        } else {
            "None"
        };
        f.debug_struct("SettingsConfig")
            .field("system_prompt", &self.system_prompt)
            .field("temperature", &self.temperature)
            .field("top_k", &self.top_k)
            .field("access_token", &token)
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryConfig {
    /// Prompt-history window in entries.
    pub window: Option<usize>,
    /// Display cap in turns. Omitted follows `window`; `0` keeps everything.
    pub display_window: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GenerationConfig {
    pub max_new_tokens: Option<u32>,
    /// Seconds before a generation is stopped. `0` disables the timeout.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CacheConfig {
    pub dir: Option<String>,
}

impl HearthConfig {
    /// Load the user's config. A missing file is `Ok(None)`.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path).map_err(|source| {
            tracing::warn!("Failed to read config at {}: {source}", path.display());
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;
        toml::from_str(&content).map(Some).map_err(|source| {
            tracing::warn!("Failed to parse config at {}: {source}", path.display());
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    #[must_use]
    pub fn model_id(&self) -> String {
        self.model
            .as_ref()
            .and_then(|m| m.id.as_deref())
            .map_or_else(|| DEFAULT_MODEL_ID.to_string(), expand_env_vars)
    }

    #[must_use]
    pub fn hub_url(&self) -> String {
        self.model
            .as_ref()
            .and_then(|m| m.hub_url.as_deref())
            .map_or_else(|| DEFAULT_HUB_URL.to_string(), expand_env_vars)
    }

    #[must_use]
    pub fn runtime_url(&self) -> String {
        self.model
            .as_ref()
            .and_then(|m| m.runtime_url.as_deref())
            .map_or_else(|| DEFAULT_RUNTIME_URL.to_string(), expand_env_vars)
    }

    #[must_use]
    pub fn model_files(&self) -> Vec<String> {
        match self.model.as_ref().and_then(|m| m.files.as_ref()) {
            Some(files) if !files.is_empty() => files.clone(),
            _ => DEFAULT_MODEL_FILES.iter().map(ToString::to_string).collect(),
        }
    }

    /// Settings as written in the file, not yet validated.
    #[must_use]
    pub fn settings_draft(&self) -> SettingsDraft {
        let mut draft = SettingsDraft::from_settings(&Settings::default());
        let Some(section) = &self.settings else {
            return draft;
        };
        if let Some(prompt) = &section.system_prompt {
            draft.system_prompt = prompt.clone();
        }
        if let Some(temperature) = section.temperature {
            draft.temperature = temperature;
        }
        if let Some(top_k) = section.top_k {
            draft.top_k = top_k;
        }
        if let Some(token) = &section.access_token {
            draft.access_token = Some(expand_env_vars(token));
        }
        draft
    }

    #[must_use]
    pub fn retention(&self) -> Retention {
        let history = self.history.as_ref();
        let window = history.and_then(|h| h.window).unwrap_or(DEFAULT_WINDOW);
        let display = match history.and_then(|h| h.display_window) {
            None => DisplayWindow::Lockstep,
            Some(0) => DisplayWindow::Unbounded,
            Some(cap) => DisplayWindow::Capped(cap),
        };
        Retention::new(window, display)
    }

    #[must_use]
    pub fn max_new_tokens(&self) -> u32 {
        self.generation
            .as_ref()
            .and_then(|g| g.max_new_tokens)
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_MAX_NEW_TOKENS)
    }

    #[must_use]
    pub fn generation_timeout(&self) -> Option<Duration> {
        self.generation
            .as_ref()
            .and_then(|g| g.timeout_secs)
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
    }

    /// Blob cache directory; defaults to `~/.hearth/cache`.
    #[must_use]
    pub fn cache_dir(&self) -> Option<PathBuf> {
        match self.cache.as_ref().and_then(|c| c.dir.as_deref()) {
            Some(dir) => expand_home(&expand_env_vars(dir)),
            None => config_dir().map(|dir| dir.join("cache")),
        }
    }
}

/// `~/.hearth`.
#[must_use]
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_DIR_NAME))
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

/// Replace `${VAR}` references with environment values. Unset variables
/// expand to nothing; an unclosed `${` is kept verbatim.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn expand_home(path: &str) -> Option<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().map(|home| home.join(rest)),
        None if path == "~" => dirs::home_dir(),
        None => Some(PathBuf::from(path)),
    }
}

/// Write `settings` into `[settings]` of the user's config file.
pub fn persist_settings(settings: &Settings) -> Result<(), ConfigError> {
    let path = config_path().ok_or(ConfigError::NoHome)?;
    persist_settings_to(&path, settings)
}

/// Write `settings` into `[settings]` of the file at `path`, keeping the rest
/// of the document (comments included) intact.
///
/// An `access_token` written as a `${VAR}` reference stays a reference as long
/// as it still expands to the saved token.
pub fn persist_settings_to(path: &Path, settings: &Settings) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(write_err)?;
        restrict_dir(parent).map_err(write_err)?;
    }

    let content = if path.exists() {
        fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        String::new()
    };
    let mut doc = content
        .parse::<DocumentMut>()
        .map_err(|source| ConfigError::Edit {
            path: path.to_path_buf(),
            source,
        })?;

    if !doc.contains_table("settings") {
        doc["settings"] = Item::Table(Table::new());
    }
    let Some(table) = doc["settings"].as_table_mut() else {
        return Err(write_err(io::Error::new(
            io::ErrorKind::InvalidData,
            "[settings] is not a table",
        )));
    };

    table["system_prompt"] = toml_edit::value(settings.system_prompt());
    table["temperature"] = toml_edit::value(settings.temperature().value());
    table["top_k"] = toml_edit::value(i64::from(settings.top_k().value()));

    match settings.access_token() {
        Some(token) => {
            let keeps_reference = table
                .get("access_token")
                .and_then(Item::as_str)
                .is_some_and(|raw| raw.contains("${") && expand_env_vars(raw) == token.expose_secret());
            if !keeps_reference {
                table["access_token"] = toml_edit::value(token.expose_secret());
            }
        }
        None => {
            table.remove("access_token");
        }
    }

    write_owner_only(path, doc.to_string().as_bytes()).map_err(write_err)?;
    tracing::info!(path = %path.display(), "Saved settings");
    Ok(())
}

/// Temp file + rename in the destination directory, mode 0600 on Unix.
fn write_owner_only(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(parent)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))?;
    }
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    let metadata = fs::metadata(dir)?;
    // Only touch directories we own.
    let our_uid = unsafe { libc::getuid() };
    if metadata.uid() == our_uid && metadata.permissions().mode() & 0o077 != 0 {
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn restrict_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
