//! Command Template Registry.
//!
//! Templates are supplied as a flat JSON object mapping a logical operation
//! name to a command template string:
//!
//! ```json
//! {
//!     "set_bias": "BIAS ${bias:.6e}",
//!     "set_scan_frame": "FRAME ${x} ${y} ${width} ${height}",
//!     "start_scan": "SCAN START"
//! }
//! ```
//!
//! Placeholders use `${name}` (named) or `${0}` (positional, indexing into the
//! argument order), optionally followed by a format spec: `${name:fmt}`.
//!
//! | spec | rendering |
//! |------|-----------|
//! | `d`, `04d` | rounded integer, optional zero-padded width |
//! | `x`, `X`, `04X` | rounded non-negative integer in hex |
//! | `.3f` | fixed-point with N decimals |
//! | `e`, `.4e` | scientific notation, optional precision |
//!
//! Every template is parsed once when the registry is built; structural
//! problems are reported as `MalformedTemplate` before the engine starts.
//! Resolution afterwards is pure string assembly.

use regex::Regex;
use spm_core::{ArgValue, CommandArgs, TemplateError};
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

/// Matches `${...}` placeholders (compiled once).
static PLACEHOLDER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]*)\}").expect("Invalid placeholder regex"));

/// A literal command string ready for the wire. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedCommand(String);

impl ResolvedCommand {
    /// Wrap a literal command that did not come from a template
    /// (diagnostics and tests).
    pub fn raw(command: impl Into<String>) -> Self {
        Self(command.into())
    }

    /// The command text, without line terminator.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the command text.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for ResolvedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResolvedCommand {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PlaceholderKey {
    Named(String),
    Positional(usize),
}

impl std::fmt::Display for PlaceholderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaceholderKey::Named(name) => f.write_str(name),
            PlaceholderKey::Positional(index) => write!(f, "{}", index),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FormatSpec {
    Decimal { width: usize },
    LowerHex { width: usize },
    UpperHex { width: usize },
    Fixed { precision: usize },
    Scientific { precision: Option<usize> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Fragment {
    Literal(String),
    Placeholder {
        key: PlaceholderKey,
        format: Option<FormatSpec>,
    },
}

/// A parsed, validated command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    name: String,
    source: String,
    fragments: Vec<Fragment>,
}

impl CommandTemplate {
    /// Parse a template, rejecting malformed placeholders.
    pub fn parse(name: &str, source: &str) -> Result<Self, TemplateError> {
        let mut fragments = Vec::new();
        let mut last = 0;

        for captures in PLACEHOLDER_REGEX.captures_iter(source) {
            let (Some(whole), Some(inner)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            push_literal(name, &source[last..whole.start()], &mut fragments)?;
            fragments.push(parse_placeholder(name, inner.as_str())?);
            last = whole.end();
        }
        push_literal(name, &source[last..], &mut fragments)?;

        Ok(Self {
            name: name.to_string(),
            source: source.to_string(),
            fragments,
        })
    }

    /// Logical name this template is registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The template text as configured.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Placeholder names in order of appearance (positional ones as their index).
    pub fn placeholders(&self) -> Vec<String> {
        self.fragments
            .iter()
            .filter_map(|fragment| match fragment {
                Fragment::Placeholder { key, .. } => Some(key.to_string()),
                Fragment::Literal(_) => None,
            })
            .collect()
    }

    /// Bind `args` into the template.
    pub fn resolve(&self, args: &CommandArgs) -> Result<ResolvedCommand, TemplateError> {
        let mut out = String::with_capacity(self.source.len() + 16);
        for fragment in &self.fragments {
            match fragment {
                Fragment::Literal(text) => out.push_str(text),
                Fragment::Placeholder { key, format } => {
                    let value = match key {
                        PlaceholderKey::Named(name) => args.get(name),
                        PlaceholderKey::Positional(index) => args.get_index(*index),
                    }
                    .ok_or_else(|| TemplateError::MissingArgument {
                        command: self.name.clone(),
                        argument: key.to_string(),
                    })?;
                    let rendered = format_value(value, *format).map_err(|reason| {
                        TemplateError::InvalidArgument {
                            command: self.name.clone(),
                            argument: key.to_string(),
                            reason,
                        }
                    })?;
                    out.push_str(&rendered);
                }
            }
        }
        Ok(ResolvedCommand(out))
    }
}

fn push_literal(
    name: &str,
    literal: &str,
    fragments: &mut Vec<Fragment>,
) -> Result<(), TemplateError> {
    if literal.contains("${") {
        return Err(TemplateError::malformed_entry(
            name,
            "unterminated placeholder",
        ));
    }
    if !literal.is_empty() {
        fragments.push(Fragment::Literal(literal.to_string()));
    }
    Ok(())
}

fn parse_placeholder(name: &str, inner: &str) -> Result<Fragment, TemplateError> {
    let (key, format) = match inner.split_once(':') {
        Some((key, spec)) => (key.trim(), Some(parse_format(name, spec.trim())?)),
        None => (inner.trim(), None),
    };

    if key.is_empty() {
        return Err(TemplateError::malformed_entry(name, "empty placeholder"));
    }

    let key = if key.chars().all(|c| c.is_ascii_digit()) {
        let index = key.parse::<usize>().map_err(|_| {
            TemplateError::malformed_entry(name, format!("invalid positional index '{}'", key))
        })?;
        PlaceholderKey::Positional(index)
    } else if is_identifier(key) {
        PlaceholderKey::Named(key.to_string())
    } else {
        return Err(TemplateError::malformed_entry(
            name,
            format!("invalid placeholder name '{}'", key),
        ));
    };

    Ok(Fragment::Placeholder { key, format })
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_width(name: &str, spec: &str, digits: &str) -> Result<usize, TemplateError> {
    if digits.is_empty() {
        return Ok(0);
    }
    digits
        .parse::<usize>()
        .map_err(|_| TemplateError::malformed_entry(name, format!("unknown format spec '{}'", spec)))
}

fn parse_format(name: &str, spec: &str) -> Result<FormatSpec, TemplateError> {
    let unknown = || TemplateError::malformed_entry(name, format!("unknown format spec '{}'", spec));

    if let Some(precision) = spec.strip_prefix('.') {
        if let Some(digits) = precision.strip_suffix('f') {
            let precision = digits.parse::<usize>().map_err(|_| unknown())?;
            return Ok(FormatSpec::Fixed { precision });
        }
        if let Some(digits) = precision.strip_suffix('e') {
            let precision = digits.parse::<usize>().map_err(|_| unknown())?;
            return Ok(FormatSpec::Scientific {
                precision: Some(precision),
            });
        }
        return Err(unknown());
    }

    if spec == "e" {
        return Ok(FormatSpec::Scientific { precision: None });
    }
    if let Some(digits) = spec.strip_suffix('d') {
        return Ok(FormatSpec::Decimal {
            width: parse_width(name, spec, digits)?,
        });
    }
    if let Some(digits) = spec.strip_suffix('x') {
        return Ok(FormatSpec::LowerHex {
            width: parse_width(name, spec, digits)?,
        });
    }
    if let Some(digits) = spec.strip_suffix('X') {
        return Ok(FormatSpec::UpperHex {
            width: parse_width(name, spec, digits)?,
        });
    }
    Err(unknown())
}

fn numeric(value: &ArgValue) -> Result<f64, String> {
    let v = value
        .as_f64()
        .ok_or_else(|| format!("'{}' is not numeric", value))?;
    if v.is_finite() {
        Ok(v)
    } else {
        Err(format!("{} is not finite", v))
    }
}

fn format_value(value: &ArgValue, format: Option<FormatSpec>) -> Result<String, String> {
    let Some(format) = format else {
        return Ok(value.to_string());
    };

    match format {
        FormatSpec::Decimal { width } => {
            let int_val = numeric(value)?.round() as i64;
            Ok(format!("{:0width$}", int_val, width = width))
        }
        FormatSpec::LowerHex { width } | FormatSpec::UpperHex { width } => {
            let rounded = numeric(value)?.round();
            if rounded < 0.0 {
                return Err(format!("{} cannot be rendered as hex", rounded));
            }
            let uint_val = rounded as u64;
            if matches!(format, FormatSpec::UpperHex { .. }) {
                Ok(format!("{:0width$X}", uint_val, width = width))
            } else {
                Ok(format!("{:0width$x}", uint_val, width = width))
            }
        }
        FormatSpec::Fixed { precision } => Ok(format!("{:.*}", precision, numeric(value)?)),
        FormatSpec::Scientific { precision } => {
            let v = numeric(value)?;
            Ok(match precision {
                Some(p) => format!("{:.*e}", p, v),
                None => format!("{:e}", v),
            })
        }
    }
}

/// The loaded name → template mapping. Immutable after construction.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, CommandTemplate>,
}

impl TemplateRegistry {
    /// Build from a JSON document that must be a flat object of strings.
    pub fn from_json_str(json: &str) -> Result<Self, TemplateError> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| TemplateError::malformed(format!("invalid JSON: {}", e)))?;

        let serde_json::Value::Object(map) = value else {
            return Err(TemplateError::malformed(
                "expected a flat JSON object of name to template string",
            ));
        };

        let mut entries = Vec::with_capacity(map.len());
        for (name, template) in map {
            match template {
                serde_json::Value::String(s) => entries.push((name, s)),
                other => {
                    return Err(TemplateError::malformed_entry(
                        name,
                        format!("expected a template string, found {}", json_kind(&other)),
                    ))
                }
            }
        }
        Self::from_entries(entries)
    }

    /// Read and parse a JSON template file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            TemplateError::malformed(format!("cannot read {}: {}", path.display(), e))
        })?;
        let registry = Self::from_json_str(&json)?;
        tracing::info!(
            path = %path.display(),
            templates = registry.len(),
            "Loaded command templates"
        );
        Ok(registry)
    }

    /// Build from `(name, template)` pairs.
    pub fn from_entries<I, K, V>(entries: I) -> Result<Self, TemplateError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let mut templates = HashMap::new();
        for (name, source) in entries {
            let name = name.into();
            if name.trim().is_empty() {
                return Err(TemplateError::malformed("empty command name"));
            }
            let template = CommandTemplate::parse(&name, source.as_ref())?;
            templates.insert(name, template);
        }
        Ok(Self { templates })
    }

    /// Resolve a logical call into a literal command string.
    pub fn resolve(&self, name: &str, args: &CommandArgs) -> Result<ResolvedCommand, TemplateError> {
        self.templates
            .get(name)
            .ok_or_else(|| TemplateError::UnknownCommand(name.to_string()))?
            .resolve(args)
    }

    /// Template registered under `name`.
    pub fn get(&self, name: &str) -> Option<&CommandTemplate> {
        self.templates.get(name)
    }

    /// Whether `name` has a template.
    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Which of `required` have no template.
    pub fn missing<'a>(&self, required: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
        required
            .into_iter()
            .filter(|name| !self.contains(name))
            .collect()
    }

    /// Number of templates.
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// True when no templates are registered.
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "a nested object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn registry() -> TemplateRegistry {
        TemplateRegistry::from_json_str(
            r#"{
                "set_bias": "BIAS ${bias:.3e}",
                "set_scan_frame": "FRAME ${x} ${y} ${width} ${height}",
                "set_pixels": "PIXELS ${lines:04d}",
                "address": "ADDR ${addr:02X}",
                "positional": "MOVE ${0} ${1:.2f}",
                "start_scan": "SCAN START",
                "price": "COST $5 ${amount:d}"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn resolves_named_placeholders() {
        let reg = registry();
        let cmd = reg
            .resolve("set_bias", &CommandArgs::new().with("bias", 0.5))
            .unwrap();
        assert_eq!(cmd.as_str(), "BIAS 5.000e-1");

        let args = CommandArgs::new()
            .with("x", 1.5)
            .with("y", -2.0)
            .with("width", 10i64)
            .with("height", 10i64);
        let cmd = reg.resolve("set_scan_frame", &args).unwrap();
        assert_eq!(cmd.as_str(), "FRAME 1.5 -2 10 10");
    }

    #[test]
    fn resolves_format_specs() {
        let reg = registry();
        let cmd = reg
            .resolve("set_pixels", &CommandArgs::new().with("lines", 256u32))
            .unwrap();
        assert_eq!(cmd.as_str(), "PIXELS 0256");

        let cmd = reg
            .resolve("address", &CommandArgs::new().with("addr", 10i64))
            .unwrap();
        assert_eq!(cmd.as_str(), "ADDR 0A");
    }

    #[test]
    fn positional_placeholders_bind_by_order() {
        let reg = registry();
        let args = CommandArgs::new().with("axis", "X").with("target", 3.14159);
        let cmd = reg.resolve("positional", &args).unwrap();
        assert_eq!(cmd.as_str(), "MOVE X 3.14");
    }

    #[test]
    fn literal_dollar_is_kept() {
        let reg = registry();
        let cmd = reg
            .resolve("price", &CommandArgs::new().with("amount", 2.6))
            .unwrap();
        assert_eq!(cmd.as_str(), "COST $5 3");
    }

    #[test]
    fn resolution_is_deterministic() {
        let reg = registry();
        let args = CommandArgs::new().with("bias", -1.25e-3);
        let first = reg.resolve("set_bias", &args).unwrap();
        for _ in 0..10 {
            assert_eq!(reg.resolve("set_bias", &args).unwrap(), first);
        }
    }

    #[test]
    fn missing_argument_iff_placeholder_unbound() {
        let reg = registry();

        let err = reg
            .resolve("set_scan_frame", &CommandArgs::new().with("x", 1.0))
            .unwrap_err();
        assert!(matches!(
            err,
            TemplateError::MissingArgument { ref argument, .. } if argument == "y"
        ));

        let err = reg.resolve("positional", &CommandArgs::new().with("a", 1.0)).unwrap_err();
        assert!(matches!(
            err,
            TemplateError::MissingArgument { ref argument, .. } if argument == "1"
        ));

        // Extra arguments are fine; templates without placeholders need nothing.
        assert!(reg
            .resolve("start_scan", &CommandArgs::new().with("unused", 1.0))
            .is_ok());
        assert!(reg.resolve("start_scan", &CommandArgs::new()).is_ok());
    }

    #[test]
    fn unknown_command() {
        let err = registry()
            .resolve("self_destruct", &CommandArgs::new())
            .unwrap_err();
        assert_eq!(err, TemplateError::UnknownCommand("self_destruct".into()));
    }

    #[test]
    fn text_with_numeric_format_is_invalid_argument() {
        let err = registry()
            .resolve("set_bias", &CommandArgs::new().with("bias", "high"))
            .unwrap_err();
        assert!(matches!(err, TemplateError::InvalidArgument { .. }));
    }

    #[test]
    fn rejects_malformed_configuration() {
        let cases = [
            r#"["not", "an", "object"]"#,
            r#"{"set_bias": 5}"#,
            r#"{"set_bias": {"template": "BIAS"}}"#,
            r#"{"set_bias": "BIAS ${bias"}"#,
            r#"{"set_bias": "BIAS ${}"}"#,
            r#"{"set_bias": "BIAS ${bias:q}"}"#,
            r#"{"set_bias": "BIAS ${bad name}"}"#,
            r#"{"": "BIAS"}"#,
            "not json at all",
        ];
        for json in cases {
            let err = TemplateRegistry::from_json_str(json).unwrap_err();
            assert!(
                matches!(err, TemplateError::MalformedTemplate { .. }),
                "expected MalformedTemplate for {}, got {:?}",
                json,
                err
            );
        }
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"poll_status": "STATUS?"}}"#).unwrap();

        let reg = TemplateRegistry::from_path(file.path()).unwrap();
        assert_eq!(reg.names(), vec!["poll_status"]);
        assert_eq!(reg.missing(["poll_status", "set_bias"]), vec!["set_bias"]);

        let err = TemplateRegistry::from_path("/nonexistent/commands.json").unwrap_err();
        assert!(matches!(err, TemplateError::MalformedTemplate { .. }));
    }

    #[test]
    fn lists_placeholders() {
        let reg = registry();
        let template = reg.get("set_scan_frame").unwrap();
        assert_eq!(template.placeholders(), vec!["x", "y", "width", "height"]);
        assert_eq!(template.source(), "FRAME ${x} ${y} ${width} ${height}");
    }
}
