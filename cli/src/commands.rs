//! Slash commands typed at the prompt.

use hearth_engine::SettingsDraft;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Plain text: send it to the model.
    Submit(String),
    Stop,
    Retry,
    Clear,
    Set { field: Field, value: String },
    Show,
    Help,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Temperature,
    TopK,
    SystemPrompt,
    Token,
}

impl Field {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "temperature" | "temp" => Some(Self::Temperature),
            "top_k" | "topk" | "top-k" => Some(Self::TopK),
            "system" | "prompt" => Some(Self::SystemPrompt),
            "token" => Some(Self::Token),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command /{0} (try /help)")]
    Unknown(String),
    #[error("usage: /set <temperature|top_k|system|token> <value>")]
    SetUsage,
    #[error("unknown setting '{0}'")]
    UnknownField(String),
    #[error("'{value}' is not a valid {expected}")]
    NotANumber {
        value: String,
        expected: &'static str,
    },
}

pub const HELP: &str = "\
Commands:
  /stop                      interrupt the running response
  /retry                     retry a failed model load
  /clear                     start a new conversation
  /set temperature <0..1>    sampling temperature
  /set top_k <1..100>        top-k cutoff
  /set system <text>         system prompt (empty restores the default)
  /set token <value|none>    access token for gated models
  /show                      print current settings
  /quit                      exit";

pub fn parse(line: &str) -> Result<Command, CommandError> {
    let Some(rest) = line.trim().strip_prefix('/') else {
        return Ok(Command::Submit(line.to_string()));
    };
    let (name, args) = rest
        .split_once(char::is_whitespace)
        .map_or((rest, ""), |(name, args)| (name, args.trim()));

    match name {
        "stop" => Ok(Command::Stop),
        "retry" => Ok(Command::Retry),
        "clear" | "new" => Ok(Command::Clear),
        "show" => Ok(Command::Show),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" | "q" => Ok(Command::Quit),
        "set" => {
            let (field, value) = args
                .split_once(char::is_whitespace)
                .map_or((args, ""), |(field, value)| (field, value.trim()));
            if field.is_empty() {
                return Err(CommandError::SetUsage);
            }
            let field =
                Field::parse(field).ok_or_else(|| CommandError::UnknownField(field.to_string()))?;
            Ok(Command::Set {
                field,
                value: value.to_string(),
            })
        }
        other => Err(CommandError::Unknown(other.to_string())),
    }
}

/// Apply one edited field to a draft. Range checks are left to validation.
pub fn apply(mut draft: SettingsDraft, field: Field, value: &str) -> Result<SettingsDraft, CommandError> {
    match field {
        Field::Temperature => {
            draft.temperature = value.parse().map_err(|_| CommandError::NotANumber {
                value: value.to_string(),
                expected: "temperature",
            })?;
        }
        Field::TopK => {
            draft.top_k = value.parse().map_err(|_| CommandError::NotANumber {
                value: value.to_string(),
                expected: "top_k",
            })?;
        }
        Field::SystemPrompt => draft.system_prompt = value.to_string(),
        Field::Token => {
            draft.access_token = match value {
                "" | "none" => None,
                token => Some(token.to_string()),
            };
        }
    }
    Ok(draft)
}
