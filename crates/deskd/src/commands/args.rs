//! Argument schemas for whitelisted commands.
//!
//! A command only accepts the arguments its schema declares. Values are checked and
//! rendered to strings here; the dispatcher substitutes them as whole argv entries.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Map;
use serde_json::Value;

/// Upper bound for string arguments without an explicit `max_length`.
const DEFAULT_MAX_LENGTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ArgType {
    Integer,
    Number,
    String,
    Boolean,
}

/// Declaration of one argument in a whitelist entry
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArgSpec {
    #[serde(rename = "type")]
    pub kind: ArgType,

    #[serde(default)]
    pub required: bool,

    /// Inclusive lower bound for numeric arguments
    pub min: Option<f64>,

    /// Inclusive upper bound for numeric arguments
    pub max: Option<f64>,

    /// Allowed values for string arguments
    pub choices: Option<Vec<String>>,

    /// Maximum length in characters for string arguments
    pub max_length: Option<usize>,

    /// Used when the caller omits the argument
    pub default: Option<Value>,
}

pub type ArgSchema = BTreeMap<String, ArgSpec>;

/// Validated arguments rendered as strings.
pub type RenderedArgs = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ArgError {
    #[error("command takes no arguments")]
    NotAccepted,

    #[error("unexpected argument '{0}'")]
    Unexpected(String),

    #[error("missing required argument '{0}'")]
    Missing(String),

    #[error("argument '{name}' must be of type {expected}")]
    WrongType { name: String, expected: ArgType },

    #[error("argument '{0}' is out of range")]
    OutOfRange(String),

    #[error("argument '{0}' is not one of the allowed values")]
    NotAllowed(String),

    #[error("argument '{0}' is too long")]
    TooLong(String),

    #[error("argument '{0}' contains disallowed characters")]
    Unsafe(String),
}

/// Check `args` against `schema` and render every present argument.
///
/// Commands without a schema accept no arguments at all.
pub fn validate(schema: Option<&ArgSchema>, args: &Map<String, Value>) -> Result<RenderedArgs, ArgError> {
    let Some(schema) = schema else {
        return if args.is_empty() {
            Ok(RenderedArgs::new())
        } else {
            Err(ArgError::NotAccepted)
        };
    };

    if let Some(name) = args.keys().find(|name| !schema.contains_key(*name)) {
        return Err(ArgError::Unexpected(name.clone()));
    }

    let mut rendered = RenderedArgs::new();
    for (name, spec) in schema {
        let value = match args.get(name).or(spec.default.as_ref()) {
            Some(value) => value,
            None if spec.required => return Err(ArgError::Missing(name.clone())),
            None => continue,
        };
        rendered.insert(name.clone(), spec.render(name, value)?);
    }
    Ok(rendered)
}

impl ArgSpec {
    /// Check a single value and render it for argv.
    pub fn render(&self, name: &str, value: &Value) -> Result<String, ArgError> {
        let wrong_type = || ArgError::WrongType {
            name: name.to_string(),
            expected: self.kind,
        };

        match self.kind {
            ArgType::Integer => {
                let n = value.as_i64().ok_or_else(wrong_type)?;
                self.check_range(name, n as f64)?;
                Ok(n.to_string())
            }
            ArgType::Number => {
                let n = value
                    .as_f64()
                    .filter(|n| n.is_finite())
                    .ok_or_else(wrong_type)?;
                self.check_range(name, n)?;
                Ok(n.to_string())
            }
            ArgType::Boolean => value
                .as_bool()
                .map(|b| b.to_string())
                .ok_or_else(wrong_type),
            ArgType::String => {
                let s = value.as_str().ok_or_else(wrong_type)?;
                if s.chars().count() > self.max_length.unwrap_or(DEFAULT_MAX_LENGTH) {
                    return Err(ArgError::TooLong(name.to_string()));
                }
                // A leading '-' would turn the value into an option of the target program.
                if s.starts_with('-') || s.chars().any(char::is_control) {
                    return Err(ArgError::Unsafe(name.to_string()));
                }
                if let Some(choices) = &self.choices {
                    if !choices.iter().any(|c| c == s) {
                        return Err(ArgError::NotAllowed(name.to_string()));
                    }
                }
                Ok(s.to_string())
            }
        }
    }

    fn check_range(&self, name: &str, n: f64) -> Result<(), ArgError> {
        let below = self.min.is_some_and(|min| n < min);
        let above = self.max.is_some_and(|max| n > max);
        if below || above {
            return Err(ArgError::OutOfRange(name.to_string()));
        }
        Ok(())
    }

    /// Reject declarations that can never validate consistently.
    pub fn check_declaration(&self, name: &str) -> Result<(), String> {
        let numeric = matches!(self.kind, ArgType::Integer | ArgType::Number);
        if !numeric && (self.min.is_some() || self.max.is_some()) {
            return Err(format!("argument '{}': min/max only apply to numbers", name));
        }
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(format!("argument '{}': min is greater than max", name));
            }
        }
        if self.kind != ArgType::String && (self.choices.is_some() || self.max_length.is_some()) {
            return Err(format!(
                "argument '{}': choices/max_length only apply to strings",
                name
            ));
        }
        if let Some(default) = &self.default {
            self.render(name, default)
                .map_err(|e| format!("invalid default: {}", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn schema() -> ArgSchema {
        let toml = r#"
            volume = { type = "integer", required = true, min = 0, max = 100 }
            ratio = { type = "number", min = 0.0, max = 1.0 }
            mute = { type = "boolean", default = false }
            profile = { type = "string", choices = ["quiet", "loud"] }
            label = { type = "string", max_length = 8 }
        "#;
        toml::from_str(toml).unwrap()
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_valid_arguments_render() {
        let rendered = validate(
            Some(&schema()),
            &args(json!({"volume": 40, "ratio": 0.5, "profile": "quiet"})),
        )
        .unwrap();
        assert_eq!(rendered.get("volume").unwrap(), "40");
        assert_eq!(rendered.get("ratio").unwrap(), "0.5");
        assert_eq!(rendered.get("mute").unwrap(), "false");
        assert_eq!(rendered.get("profile").unwrap(), "quiet");
        assert!(!rendered.contains_key("label"));
    }

    #[test]
    fn test_no_schema_rejects_any_argument() {
        assert_eq!(validate(None, &Map::new()), Ok(RenderedArgs::new()));
        assert_eq!(
            validate(None, &args(json!({"x": 1}))),
            Err(ArgError::NotAccepted)
        );
    }

    #[test]
    fn test_rejections() {
        let schema = schema();
        let cases = [
            (json!({"volume": 1, "extra": 1}), ArgError::Unexpected("extra".into())),
            (json!({}), ArgError::Missing("volume".into())),
            (
                json!({"volume": "10"}),
                ArgError::WrongType {
                    name: "volume".into(),
                    expected: ArgType::Integer,
                },
            ),
            (
                json!({"volume": 1.5}),
                ArgError::WrongType {
                    name: "volume".into(),
                    expected: ArgType::Integer,
                },
            ),
            (json!({"volume": 101}), ArgError::OutOfRange("volume".into())),
            (json!({"volume": 1, "ratio": -0.1}), ArgError::OutOfRange("ratio".into())),
            (json!({"volume": 1, "profile": "max"}), ArgError::NotAllowed("profile".into())),
            (json!({"volume": 1, "label": "123456789"}), ArgError::TooLong("label".into())),
            (json!({"volume": 1, "label": "--rm"}), ArgError::Unsafe("label".into())),
            (json!({"volume": 1, "label": "a\nb"}), ArgError::Unsafe("label".into())),
        ];
        for (input, expected) in cases {
            assert_eq!(
                validate(Some(&schema), &args(input.clone())),
                Err(expected),
                "{}",
                input
            );
        }
    }

    #[test]
    fn test_check_declaration() {
        let bad_range: ArgSpec = toml::from_str("type = \"integer\"\nmin = 5\nmax = 1").unwrap();
        assert!(bad_range.check_declaration("x").is_err());

        let bad_default: ArgSpec = toml::from_str("type = \"integer\"\ndefault = \"no\"").unwrap();
        assert!(bad_default.check_declaration("x").is_err());

        let choices_on_bool: ArgSpec =
            toml::from_str("type = \"boolean\"\nchoices = [\"a\"]").unwrap();
        assert!(choices_on_bool.check_declaration("x").is_err());

        for (name, spec) in schema() {
            assert!(spec.check_declaration(&name).is_ok(), "{}", name);
        }
    }

    #[test]
    fn test_unknown_schema_field_is_rejected() {
        assert!(toml::from_str::<ArgSpec>("type = \"string\"\npattern = \".*\"").is_err());
    }
}
