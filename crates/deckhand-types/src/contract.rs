//! Application contracts.
//!
//! A contract declares which OS families an installer supports, the ordered
//! input fields it accepts, the script to run and its time budget. Contracts
//! are decoded from manifest documents through [`ContractDef`], which is
//! checked and converted into the typed [`Contract`]; a contract that exists
//! as a value is always structurally valid.
//!
//! ```yaml
//! id: nginx
//! name: Nginx
//! version: "1.24"
//! os_requirements:
//!   family: [debian, ubuntu]
//!   min_version: "20.04"
//! inputs:
//!   - name: server_name
//!     type: string
//!     label: Server name
//!     validation:
//!       pattern: '^[a-z0-9\-\.]+$'
//! install_script: install.sh
//! timeout_seconds: 900
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::TypesError;

/// Environment variables a field name may never shadow once upper-cased.
///
/// Covers the agent's own markers, the default allowlist, and variables that
/// change how the interpreter or the dynamic loader behave.
pub const RESERVED_ENV_NAMES: &[&str] = &[
    "PATH",
    "LANG",
    "LC_ALL",
    "TZ",
    "HOME",
    "SHELL",
    "IFS",
    "ENV",
    "BASH_ENV",
    "BASHOPTS",
    "SHELLOPTS",
    "PS4",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "DEBIAN_FRONTEND",
    "PROVISIONING_JOB",
    "PROVISIONING_JOB_ID",
    "PROVISIONING_ATTEMPT",
];

const DEFAULT_SCRIPT: &str = "install.sh";
const DEFAULT_TIMEOUT_SECS: u64 = 600;
const MAX_TIMEOUT_SECS: u64 = 86_400;

// ─────────────────────────────────────────────────────────────────────────────
// Patterns
// ─────────────────────────────────────────────────────────────────────────────

/// A compiled regular expression that round-trips through its source text.
///
/// Matching is anchored at the start of the value: `[a-z]+` accepts
/// `"abc"` but not `"Xabc"`. Add `$` to also pin the end.
#[derive(Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    /// Compile a pattern.
    pub fn new(source: &str) -> Result<Self, regex::Error> {
        Regex::new(source)?;
        let regex = Regex::new(&format!(r"\A(?:{source})"))?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    /// Whether `value` matches the pattern from its first character.
    pub fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }

    /// The pattern's source text.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({:?})", self.as_str())
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Pattern::new(&source).map_err(serde::de::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Field Kinds
// ─────────────────────────────────────────────────────────────────────────────

/// Length and pattern rules for string-valued fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextRules {
    pub pattern: Option<Pattern>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
}

/// Bounds for whole-number fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NumericRules {
    pub min_value: Option<i64>,
    pub max_value: Option<i64>,
}

/// Declared type of an input field with the rules that apply to it.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Text(TextRules),
    Integer(NumericRules),
    Boolean,
    /// Always treated as sensitive.
    Secret(TextRules),
    Choice { allowed: Vec<String> },
    Email(TextRules),
    /// Whole number additionally bounded to 1-65535.
    Port(NumericRules),
}

impl FieldKind {
    /// Short name used in messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Integer(_) => "integer",
            Self::Boolean => "boolean",
            Self::Secret(_) => "secret",
            Self::Choice { .. } => "choice",
            Self::Email(_) => "email",
            Self::Port(_) => "port",
        }
    }
}

/// One declared input field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub label: String,
    pub kind: FieldKind,
    pub required: bool,
    pub default: Option<String>,
    /// Field is only active when every earlier field named here resolved to
    /// the given value.
    pub visible_if: Option<BTreeMap<String, String>>,
    pub sensitive: bool,
}

impl FieldSpec {
    /// Whether the value must be kept out of logs and messages.
    pub fn is_sensitive(&self) -> bool {
        self.sensitive || matches!(self.kind, FieldKind::Secret(_))
    }

    /// Environment variable name exposed to the installer.
    pub fn env_name(&self) -> String {
        self.name.to_ascii_uppercase()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// OS Requirements
// ─────────────────────────────────────────────────────────────────────────────

/// Supported operating system families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Debian,
    Ubuntu,
    Centos,
    Rhel,
    Fedora,
    Alpine,
}

impl OsFamily {
    /// Match an `/etc/os-release` `ID` value.
    pub fn from_os_release_id(id: &str) -> Option<Self> {
        match id.trim().to_ascii_lowercase().as_str() {
            "debian" => Some(Self::Debian),
            "ubuntu" => Some(Self::Ubuntu),
            "centos" => Some(Self::Centos),
            "rhel" => Some(Self::Rhel),
            "fedora" => Some(Self::Fedora),
            "alpine" => Some(Self::Alpine),
            _ => None,
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Debian => "debian",
            Self::Ubuntu => "ubuntu",
            Self::Centos => "centos",
            Self::Rhel => "rhel",
            Self::Fedora => "fedora",
            Self::Alpine => "alpine",
        };
        f.write_str(name)
    }
}

/// Operating systems an installer supports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsRequirement {
    #[serde(default)]
    pub family: Vec<OsFamily>,
    #[serde(default)]
    pub min_version: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Contract
// ─────────────────────────────────────────────────────────────────────────────

/// Validated application contract.
#[derive(Debug, Clone, PartialEq)]
pub struct Contract {
    pub id: String,
    pub name: String,
    pub version: String,
    pub os_requirements: OsRequirement,
    /// Fields in declaration order.
    pub inputs: Vec<FieldSpec>,
    pub install_script: String,
    pub timeout: Duration,
    /// Safe to re-run without duplicating side effects.
    pub idempotent: bool,
}

impl Contract {
    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.inputs.iter().find(|f| f.name == name)
    }
}

/// Raw validation rules as written in a manifest.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ValidationDef {
    pub pattern: Option<Pattern>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub min_value: Option<i64>,
    pub max_value: Option<i64>,
    pub allowed_values: Option<Vec<String>>,
}

impl ValidationDef {
    /// Names of the rules this definition sets.
    fn declared(&self) -> Vec<&'static str> {
        [
            ("pattern", self.pattern.is_some()),
            ("min_length", self.min_length.is_some()),
            ("max_length", self.max_length.is_some()),
            ("min_value", self.min_value.is_some()),
            ("max_value", self.max_value.is_some()),
            ("allowed_values", self.allowed_values.is_some()),
        ]
        .into_iter()
        .filter_map(|(rule, set)| set.then_some(rule))
        .collect()
    }
}

/// Rules each manifest type honours; `None` for unknown types.
fn applicable_rules(kind: &str) -> Option<&'static [&'static str]> {
    match kind {
        "text" | "string" | "secret" | "password" | "email" => {
            Some(&["pattern", "min_length", "max_length"])
        }
        "integer" | "port" => Some(&["min_value", "max_value"]),
        "choice" | "select" | "enum" => Some(&["allowed_values"]),
        "boolean" => Some(&[]),
        _ => None,
    }
}

/// Raw input field as written in a manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub validation: ValidationDef,
    #[serde(default)]
    pub visible_if: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub sensitive: bool,
}

/// Raw contract as written in a manifest. Unknown keys (category, tags, ...)
/// belong to the registry and are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ContractDef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub os_requirements: OsRequirement,
    #[serde(default)]
    pub inputs: Vec<FieldDef>,
    #[serde(default = "default_script")]
    pub install_script: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub idempotent: bool,
}

fn default_true() -> bool {
    true
}

fn default_script() -> String {
    DEFAULT_SCRIPT.to_string()
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn invalid(message: impl Into<String>) -> TypesError {
    TypesError::InvalidContract(message.into())
}

fn is_app_id(s: &str) -> bool {
    !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

fn is_field_name(s: &str) -> bool {
    let mut bytes = s.bytes();
    matches!(bytes.next(), Some(b) if b.is_ascii_lowercase() || b == b'_')
        && bytes.all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

fn is_script_name(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('.')
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
}

impl TryFrom<ContractDef> for Contract {
    type Error = TypesError;

    fn try_from(def: ContractDef) -> crate::Result<Self> {
        if !is_app_id(&def.id) {
            return Err(invalid(format!("id '{}' must match ^[a-z0-9-]+$", def.id)));
        }
        if !is_script_name(&def.install_script) {
            return Err(invalid(format!(
                "install_script '{}' must be a plain file name",
                def.install_script
            )));
        }
        if def.timeout_seconds == 0 || def.timeout_seconds > MAX_TIMEOUT_SECS {
            return Err(invalid(format!(
                "timeout_seconds {} outside 1-{MAX_TIMEOUT_SECS}",
                def.timeout_seconds
            )));
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut inputs = Vec::with_capacity(def.inputs.len());
        for field in def.inputs {
            let spec = convert_field(field, &seen)?;
            seen.insert(spec.name.clone());
            inputs.push(spec);
        }

        Ok(Contract {
            name: def.name.unwrap_or_else(|| def.id.clone()),
            id: def.id,
            version: def.version.unwrap_or_default(),
            os_requirements: def.os_requirements,
            inputs,
            install_script: def.install_script,
            timeout: Duration::from_secs(def.timeout_seconds),
            idempotent: def.idempotent,
        })
    }
}

fn convert_field(def: FieldDef, earlier: &HashSet<String>) -> crate::Result<FieldSpec> {
    let name = def.name;
    if !is_field_name(&name) {
        return Err(invalid(format!(
            "field name '{name}' must match ^[a-z_][a-z0-9_]*$"
        )));
    }
    if earlier.contains(&name) {
        return Err(invalid(format!("field '{name}' declared twice")));
    }
    let env_name = name.to_ascii_uppercase();
    if RESERVED_ENV_NAMES.contains(&env_name.as_str()) {
        return Err(invalid(format!(
            "field '{name}' would shadow reserved variable {env_name}"
        )));
    }
    if let Some(conditions) = &def.visible_if {
        if let Some(unknown) = conditions.keys().find(|k| !earlier.contains(*k)) {
            return Err(invalid(format!(
                "field '{name}' visible_if references '{unknown}', which is not declared before it"
            )));
        }
    }

    let v = def.validation;
    // Fail closed on rules the type cannot enforce.
    if let Some(applicable) = applicable_rules(&def.kind)
        && let Some(rule) = v.declared().into_iter().find(|r| !applicable.contains(r))
    {
        return Err(invalid(format!(
            "field '{name}': {rule} does not apply to type '{}'",
            def.kind
        )));
    }
    if let (Some(min), Some(max)) = (v.min_length, v.max_length)
        && min > max
    {
        return Err(invalid(format!("field '{name}': min_length > max_length")));
    }
    if let (Some(min), Some(max)) = (v.min_value, v.max_value)
        && min > max
    {
        return Err(invalid(format!("field '{name}': min_value > max_value")));
    }

    let text = TextRules {
        pattern: v.pattern,
        min_length: v.min_length,
        max_length: v.max_length,
    };
    let numeric = NumericRules {
        min_value: v.min_value,
        max_value: v.max_value,
    };

    let kind = match def.kind.as_str() {
        "text" | "string" => FieldKind::Text(text),
        "integer" => FieldKind::Integer(numeric),
        "boolean" => FieldKind::Boolean,
        "secret" | "password" => FieldKind::Secret(text),
        "email" => FieldKind::Email(text),
        "port" => {
            let out_of_range = |b: Option<i64>| b.is_some_and(|b| !(1..=65_535).contains(&b));
            if out_of_range(numeric.min_value) || out_of_range(numeric.max_value) {
                return Err(invalid(format!(
                    "field '{name}': port bounds must lie within 1-65535"
                )));
            }
            FieldKind::Port(numeric)
        }
        "choice" | "select" | "enum" => {
            let allowed = v.allowed_values.unwrap_or_default();
            if allowed.is_empty() {
                return Err(invalid(format!(
                    "field '{name}': choice fields need allowed_values"
                )));
            }
            FieldKind::Choice { allowed }
        }
        other => {
            return Err(invalid(format!("field '{name}': unknown type '{other}'")));
        }
    };

    Ok(FieldSpec {
        label: def.label.unwrap_or_else(|| name.clone()),
        name,
        kind,
        required: def.required,
        default: def.default,
        visible_if: def.visible_if,
        sensitive: def.sensitive,
    })
}
