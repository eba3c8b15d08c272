//! User-editable generation settings.
//!
//! [`SettingsDraft`] is the raw, unvalidated candidate coming from the user or
//! the config file. [`Settings`] is the validated snapshot: existence of a
//! value is the proof that its temperature and top-K are within bounds.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

const DEFAULT_TEMPERATURE: f64 = 0.7;
const DEFAULT_TOP_K: u32 = 50;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SettingsError {
    #[error("Temperature must be between 0.0 and 1.0 (got {0})")]
    TemperatureOutOfRange(f64),
    #[error("Top-K must be between 1 and 100 (got {0})")]
    TopKOutOfRange(i64),
}

/// Sampling temperature in `[0.0, 1.0]`, boundaries inclusive.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Temperature(f64);

impl Temperature {
    pub const MIN: f64 = 0.0;
    pub const MAX: f64 = 1.0;

    pub fn new(value: f64) -> Result<Self, SettingsError> {
        // NaN fails both comparisons, so check finiteness explicitly.
        if !value.is_finite() || !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(SettingsError::TemperatureOutOfRange(value));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub const fn value(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Temperature {
    type Error = SettingsError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Temperature> for f64 {
    fn from(value: Temperature) -> Self {
        value.0
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// Top-K sampling cutoff in `[1, 100]`, boundaries inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u32")]
pub struct TopK(u32);

impl TopK {
    pub const MIN: u32 = 1;
    pub const MAX: u32 = 100;

    pub fn new(value: i64) -> Result<Self, SettingsError> {
        match u32::try_from(value) {
            Ok(v) if (Self::MIN..=Self::MAX).contains(&v) => Ok(Self(v)),
            _ => Err(SettingsError::TopKOutOfRange(value)),
        }
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl TryFrom<i64> for TopK {
    type Error = SettingsError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TopK> for u32 {
    fn from(value: TopK) -> Self {
        value.0
    }
}

impl fmt::Display for TopK {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Credential for gated model repositories.
///
/// Serializes as a plain string because it has to cross the worker boundary
/// inside a load request; `Debug` never prints it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
    /// Returns `None` for blank input so "no token" has a single representation.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    #[must_use]
    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

/// Unvalidated settings candidate, as typed by the user.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsDraft {
    pub system_prompt: String,
    pub temperature: f64,
    pub top_k: i64,
    pub access_token: Option<String>,
}

impl SettingsDraft {
    /// Start a draft from the current snapshot, for single-field edits.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            system_prompt: settings.system_prompt.clone(),
            temperature: settings.temperature.value(),
            top_k: i64::from(settings.top_k.value()),
            access_token: settings
                .access_token
                .as_ref()
                .map(|token| token.expose_secret().to_string()),
        }
    }
}

/// How a settings save relates to the active model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsChange {
    /// Only the system prompt (or nothing) changed; the loaded model stays valid.
    PromptOnly,
    /// Sampling parameters or the credential changed; the model must be reloaded.
    ReloadRequired,
}

/// Validated, immutable settings snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    system_prompt: String,
    temperature: Temperature,
    top_k: TopK,
    access_token: Option<AccessToken>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: Temperature(DEFAULT_TEMPERATURE),
            top_k: TopK(DEFAULT_TOP_K),
            access_token: None,
        }
    }
}

impl Settings {
    /// Validate a draft. Nothing is constructed unless every bound holds.
    pub fn validate(draft: SettingsDraft) -> Result<Self, SettingsError> {
        let temperature = Temperature::new(draft.temperature)?;
        let top_k = TopK::new(draft.top_k)?;
        let system_prompt = match draft.system_prompt.trim() {
            "" => DEFAULT_SYSTEM_PROMPT.to_string(),
            prompt => prompt.to_string(),
        };
        Ok(Self {
            system_prompt,
            temperature,
            top_k,
            access_token: draft.access_token.and_then(AccessToken::new),
        })
    }

    #[must_use]
    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    #[must_use]
    pub const fn temperature(&self) -> Temperature {
        self.temperature
    }

    #[must_use]
    pub const fn top_k(&self) -> TopK {
        self.top_k
    }

    #[must_use]
    pub fn access_token(&self) -> Option<&AccessToken> {
        self.access_token.as_ref()
    }

    /// Classify this snapshot against the one it replaces.
    #[must_use]
    pub fn change_from(&self, previous: &Settings) -> SettingsChange {
        if self.temperature != previous.temperature
            || self.top_k != previous.top_k
            || self.access_token != previous.access_token
        {
            SettingsChange::ReloadRequired
        } else {
            SettingsChange::PromptOnly
        }
    }
}

impl TryFrom<SettingsDraft> for Settings {
    type Error = SettingsError;

    fn try_from(draft: SettingsDraft) -> Result<Self, Self::Error> {
        Self::validate(draft)
    }
}
