//! Environment variable interpolation for config files.
//!
//! Recognised forms:
//! - `$VAR` and `${VAR}` substitute the variable and fail if it is unset
//! - `${VAR:-fallback}` uses the fallback when VAR is unset or empty
//! - `${VAR-fallback}` uses the fallback only when VAR is unset
//! - `$$` produces a literal `$`

use regex::{Captures, Regex};
use std::env;
use std::sync::LazyLock;

static VAR_REFERENCE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$
        |
        \$\{ (?P<braced>[A-Za-z_][A-Za-z0-9_]*) (?: (?P<op>:?-) (?P<fallback>[^}]*) )? \}
        |
        \$ (?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .ok()
});

/// How a reference wants missing or empty values handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fallback<'a> {
    /// No fallback: an unset variable is an error.
    Required,
    /// `${VAR-x}`: fallback only when unset.
    WhenUnset(&'a str),
    /// `${VAR:-x}`: fallback when unset or empty.
    WhenUnsetOrEmpty(&'a str),
}

impl<'a> Fallback<'a> {
    fn from_captures(caps: &Captures<'a>) -> Self {
        let value = caps.name("fallback").map(|m| m.as_str()).unwrap_or("");
        match caps.name("op").map(|m| m.as_str()) {
            Some(":-") => Fallback::WhenUnsetOrEmpty(value),
            Some(_) => Fallback::WhenUnset(value),
            None => Fallback::Required,
        }
    }
}

/// Resolve one variable reference.
fn resolve(name: &str, fallback: Fallback<'_>) -> Result<String, String> {
    match (env::var(name), fallback) {
        (Ok(value), _) if value.contains('\n') || value.contains('\r') => Err(format!(
            "environment variable '{name}' contains newlines, which is not allowed"
        )),
        (Ok(value), Fallback::WhenUnsetOrEmpty(default)) if value.is_empty() => {
            Ok(default.to_string())
        }
        (Ok(value), _) => Ok(value),
        (Err(_), Fallback::WhenUnset(default) | Fallback::WhenUnsetOrEmpty(default)) => {
            Ok(default.to_string())
        }
        (Err(_), Fallback::Required) => {
            Err(format!("environment variable '{name}' is not set"))
        }
    }
}

/// Interpolate environment variables in `input`.
///
/// Every problem is collected so a config with several missing variables
/// reports all of them at once.
pub fn interpolate(input: &str) -> Result<String, Vec<String>> {
    let Some(pattern) = VAR_REFERENCE.as_ref() else {
        return Err(vec!["interpolation pattern failed to compile".to_string()]);
    };

    let mut errors = Vec::new();
    let text = pattern.replace_all(input, |caps: &Captures| {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
            return "$".to_string();
        };

        match resolve(name.as_str(), Fallback::from_captures(caps)) {
            Ok(value) => value,
            Err(message) => {
                errors.push(message);
                whole.to_string()
            }
        }
    });

    if errors.is_empty() {
        Ok(text.into_owned())
    } else {
        Err(errors)
    }
}
