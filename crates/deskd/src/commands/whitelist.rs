//! The closed set of commands the agent may run.
//!
//! The whitelist document (TOML or JSON, chosen by file extension) maps command names to
//! an invocation. Invocations are split into argv once at load time and never pass
//! through a shell.
//!
//! ```toml
//! [lock]
//! cmd = "loginctl lock-session"
//! platforms = ["linux"]
//!
//! [volume]
//! cmd = ["playerctl", "volume", "{level}"]
//! wait = true
//! args.level = { type = "number", required = true, min = 0.0, max = 1.0 }
//! ```

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::error;
use tracing::info;

use super::args::ArgSchema;
use super::args::RenderedArgs;
use super::platform::Platform;

const MAX_NAME_LENGTH: usize = 100;
const MAX_COMMAND_LENGTH: usize = 1000;
const SHELL_METACHARACTERS: &[char] = &['|', '>', '<', '&', ';', '$', '`', '\n', '(', ')'];

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawInvocation {
    Line(String),
    Argv(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCommand {
    cmd: RawInvocation,

    #[serde(default)]
    wait: bool,

    #[serde(default)]
    platforms: Vec<Platform>,

    args: Option<ArgSchema>,

    /// Seconds; overrides the global command timeout
    timeout: Option<u64>,
}

/// One argv entry of a command template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Literal(String),
    /// `{name}`: replaced by the rendered argument, dropped when an optional argument is absent
    Arg(String),
}

/// A validated whitelist entry
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDefinition {
    pub name: String,
    pub program: String,
    pub args: Vec<Token>,
    pub wait: bool,
    /// Empty means every platform
    pub platforms: BTreeSet<Platform>,
    pub schema: Option<ArgSchema>,
    pub timeout: Option<Duration>,
}

impl CommandDefinition {
    pub fn supports(&self, platform: Option<Platform>) -> bool {
        if self.platforms.is_empty() {
            return true;
        }
        platform.is_some_and(|p| self.platforms.contains(&p))
    }

    /// Build the argv for this command from validated arguments.
    pub fn argv(&self, rendered: &RenderedArgs) -> Vec<String> {
        self.args
            .iter()
            .filter_map(|token| match token {
                Token::Literal(s) => Some(s.clone()),
                Token::Arg(name) => rendered.get(name).cloned(),
            })
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WhitelistError {
    #[error("Failed to read whitelist {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse whitelist TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Failed to parse whitelist JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Whitelisted commands keyed by exact, case-sensitive name
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    commands: BTreeMap<String, CommandDefinition>,
}

impl Whitelist {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load the whitelist document; `.json` files are parsed as JSON, anything else as TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, WhitelistError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| WhitelistError::Io(path.to_path_buf(), e))?;

        let whitelist = if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json_str(&contents)?
        } else {
            Self::from_toml_str(&contents)?
        };
        info!(
            "Loaded {} whitelisted commands from {}",
            whitelist.len(),
            path.display()
        );
        Ok(whitelist)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, WhitelistError> {
        let raw: BTreeMap<String, toml::Value> = toml::from_str(contents)?;
        Ok(Self::from_entries(raw.into_iter().map(|(name, value)| {
            let entry = value.try_into::<RawCommand>().map_err(|e| e.to_string());
            (name, entry)
        })))
    }

    pub fn from_json_str(contents: &str) -> Result<Self, WhitelistError> {
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(contents)?;
        Ok(Self::from_entries(raw.into_iter().map(|(name, value)| {
            let entry = serde_json::from_value::<RawCommand>(value).map_err(|e| e.to_string());
            (name, entry)
        })))
    }

    /// Invalid entries are logged and skipped; they never make the whole document fail.
    fn from_entries(
        entries: impl Iterator<Item = (String, Result<RawCommand, String>)>,
    ) -> Self {
        let mut commands = BTreeMap::new();
        for (name, raw) in entries {
            match raw.and_then(|raw| build_definition(&name, raw)) {
                Ok(definition) => {
                    commands.insert(name, definition);
                }
                Err(e) => error!("Skipping whitelist entry '{}': {}", name, e),
            }
        }
        Self { commands }
    }

    pub fn get(&self, name: &str) -> Option<&CommandDefinition> {
        self.commands.get(name)
    }

    /// Names of the commands runnable on `platform`, sorted.
    pub fn names_for(&self, platform: Option<Platform>) -> Vec<String> {
        self.commands
            .values()
            .filter(|definition| definition.supports(platform))
            .map(|definition| definition.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LENGTH
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn build_definition(name: &str, raw: RawCommand) -> Result<CommandDefinition, String> {
    if !is_valid_name(name) {
        return Err("names may only contain letters, digits, '_' and '-' (max 100)".to_string());
    }

    let argv = match raw.cmd {
        RawInvocation::Line(line) => {
            check_text(&line)?;
            split_command_line(&line)?
        }
        RawInvocation::Argv(argv) => {
            for arg in &argv {
                check_text(arg)?;
            }
            argv
        }
    };

    let mut tokens = argv.into_iter().map(|arg| parse_token(&arg));
    let program = match tokens.next() {
        Some(Ok(Token::Literal(program))) => program,
        Some(Ok(Token::Arg(_))) => return Err("the program itself cannot be a placeholder".to_string()),
        Some(Err(e)) => return Err(e),
        None => return Err("empty command".to_string()),
    };
    let args = tokens.collect::<Result<Vec<_>, _>>()?;

    if let Some(schema) = &raw.args {
        for (arg_name, spec) in schema {
            spec.check_declaration(arg_name)?;
        }
    }
    for token in &args {
        if let Token::Arg(arg) = token {
            let declared = raw.args.as_ref().is_some_and(|s| s.contains_key(arg));
            if !declared {
                return Err(format!("placeholder '{{{}}}' is not a declared argument", arg));
            }
        }
    }

    if raw.timeout == Some(0) {
        return Err("timeout must be at least 1 second".to_string());
    }

    Ok(CommandDefinition {
        name: name.to_string(),
        program,
        args,
        wait: raw.wait,
        platforms: raw.platforms.into_iter().collect(),
        schema: raw.args,
        timeout: raw.timeout.map(Duration::from_secs),
    })
}

fn check_text(text: &str) -> Result<(), String> {
    if text.len() > MAX_COMMAND_LENGTH {
        return Err(format!("command longer than {} characters", MAX_COMMAND_LENGTH));
    }
    if let Some(c) = text.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(format!("shell metacharacter {:?} is not allowed", c));
    }
    Ok(())
}

/// A token is either literal text or exactly `{name}`; braces anywhere else are rejected.
fn parse_token(arg: &str) -> Result<Token, String> {
    if let Some(inner) = arg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
        if is_valid_name(inner) {
            return Ok(Token::Arg(inner.to_string()));
        }
    }
    if arg.contains(['{', '}']) {
        return Err(format!("placeholder in '{}' must be a whole argument", arg));
    }
    Ok(Token::Literal(arg.to_string()))
}

/// Split a command line on whitespace, honouring single and double quotes.
///
/// Inside double quotes `\"` and `\\` are escapes. No other shell syntax is interpreted.
fn split_command_line(line: &str) -> Result<Vec<String>, String> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err("unterminated single quote".to_string()),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => return Err("unterminated double quote".to_string()),
                        },
                        Some(c) => current.push(c),
                        None => return Err("unterminated double quote".to_string()),
                    }
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    argv.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        argv.push(current);
    }
    Ok(argv)
}
