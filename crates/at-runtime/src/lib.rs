#![forbid(unsafe_code)]

use std::fmt;

use at_core::ExecutionMode;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MATERIAL_ID: i64 = 1;
pub const DEFAULT_MODEL_NAME: &str = "tabata";
pub const DEFAULT_MAX_OUTPUT_ELEMENTS: usize = 1 << 24;
const MAX_CONFIG_BYTES: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Dispatch,
    Policy,
    Normalization,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    pub fn entries_of(&self, kind: EvidenceKind) -> impl Iterator<Item = &EvidenceEntry> {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }

    #[must_use]
    pub fn last(&self) -> Option<&EvidenceEntry> {
        self.entries.last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One JSON object per line, in recording order.
    pub fn to_jsonl(&self) -> Result<String, RuntimeError> {
        let mut out = String::new();
        for entry in &self.entries {
            let line = serde_json::to_string(entry).map_err(|error| RuntimeError::Export {
                reason: error.to_string(),
            })?;
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    InvalidConfig { reason: String },
    UnknownField { field: String },
    Export { reason: String },
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig { reason } => write!(f, "invalid dispatch config: {reason}"),
            Self::UnknownField { field } => write!(f, "unknown config field '{field}'"),
            Self::Export { reason } => write!(f, "evidence export failed: {reason}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigMode {
    Strict,
    Hardened,
}

impl From<ConfigMode> for ExecutionMode {
    fn from(value: ConfigMode) -> Self {
        match value {
            ConfigMode::Strict => Self::Strict,
            ConfigMode::Hardened => Self::Hardened,
        }
    }
}

impl From<ExecutionMode> for ConfigMode {
    fn from(value: ExecutionMode) -> Self {
        match value {
            ExecutionMode::Strict => Self::Strict,
            ExecutionMode::Hardened => Self::Hardened,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    mode: ConfigMode,
    default_material: i64,
    default_model: String,
    max_output_elements: usize,
}

impl Default for ConfigFile {
    fn default() -> Self {
        DispatchConfig::default().into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    pub mode: ExecutionMode,
    pub default_material: i64,
    pub default_model: String,
    pub max_output_elements: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Strict,
            default_material: DEFAULT_MATERIAL_ID,
            default_model: DEFAULT_MODEL_NAME.to_string(),
            max_output_elements: DEFAULT_MAX_OUTPUT_ELEMENTS,
        }
    }
}

impl From<DispatchConfig> for ConfigFile {
    fn from(value: DispatchConfig) -> Self {
        Self {
            mode: value.mode.into(),
            default_material: value.default_material,
            default_model: value.default_model,
            max_output_elements: value.max_output_elements,
        }
    }
}

impl DispatchConfig {
    #[must_use]
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_max_output_elements(mut self, max_output_elements: usize) -> Self {
        self.max_output_elements = max_output_elements;
        self
    }

    /// Missing fields take their defaults; unknown fields are rejected.
    pub fn from_json(input: &str) -> Result<Self, RuntimeError> {
        if input.len() > MAX_CONFIG_BYTES {
            return Err(RuntimeError::InvalidConfig {
                reason: format!(
                    "config payload exceeds max bytes: actual={} max={MAX_CONFIG_BYTES}",
                    input.len()
                ),
            });
        }
        let file: ConfigFile = serde_json::from_str(input).map_err(|error| {
            let message = error.to_string();
            match extract_unknown_field(&message) {
                Some(field) => RuntimeError::UnknownField { field },
                None => RuntimeError::InvalidConfig { reason: message },
            }
        })?;
        let config = Self {
            mode: file.mode.into(),
            default_material: file.default_material,
            default_model: file.default_model,
            max_output_elements: file.max_output_elements,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, RuntimeError> {
        serde_json::to_string(&ConfigFile::from(self.clone())).map_err(|error| {
            RuntimeError::Export {
                reason: error.to_string(),
            }
        })
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.max_output_elements == 0 {
            return Err(RuntimeError::InvalidConfig {
                reason: "max_output_elements must be positive".to_string(),
            });
        }
        if self.default_model.is_empty() {
            return Err(RuntimeError::InvalidConfig {
                reason: "default_model must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    config: DispatchConfig,
    ledger: EvidenceLedger,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(config: DispatchConfig) -> Self {
        let mut ledger = EvidenceLedger::new();
        ledger.record(
            EvidenceKind::Policy,
            format!("mode initialized to {}", config.mode.label()),
        );
        Self { config, ledger }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.config.mode
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.config.mode = mode;
        self.ledger.record(
            EvidenceKind::Policy,
            format!("mode switched to {}", mode.label()),
        );
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut EvidenceLedger {
        &mut self.ledger
    }

    pub fn record_failure<E>(&mut self, op: &str, error: &E)
    where
        E: fmt::Display + ?Sized,
    {
        self.ledger.record(
            EvidenceKind::Failure,
            format!("{op} rejected mode={}: {error}", self.config.mode.label()),
        );
    }
}

fn extract_unknown_field(message: &str) -> Option<String> {
    let start = message.find("unknown field `")? + "unknown field `".len();
    let end = message[start..].find('`')? + start;
    Some(message[start..end].to_string())
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

#[cfg(test)]
mod tests {
    use at_core::ExecutionMode;
    use proptest::prelude::*;

    use super::{
        DEFAULT_MAX_OUTPUT_ELEMENTS, DispatchConfig, EvidenceEntry, EvidenceKind, RuntimeContext,
        RuntimeError,
    };

    #[test]
    fn ledger_records_policy_and_custom_events() {
        let mut ctx = RuntimeContext::new(DispatchConfig::default());
        ctx.ledger_mut()
            .record(EvidenceKind::Dispatch, "dispatch decision");

        assert_eq!(ctx.ledger().len(), 2);
        assert_eq!(ctx.ledger().entries()[1].kind, EvidenceKind::Dispatch);
        assert_eq!(ctx.ledger().entries_of(EvidenceKind::Policy).count(), 1);
    }

    #[test]
    fn mode_switch_records_event() {
        let mut ctx = RuntimeContext::new(DispatchConfig::default());
        ctx.set_mode(ExecutionMode::Hardened);

        assert_eq!(ctx.mode(), ExecutionMode::Hardened);
        assert_eq!(ctx.ledger().len(), 2);
        let last = ctx.ledger().last().expect("policy entry");
        assert_eq!(last.summary, "mode switched to hardened");
    }

    #[test]
    fn failures_carry_operation_and_diagnostic() {
        let mut ctx = RuntimeContext::new(DispatchConfig::default());
        let err = RuntimeError::InvalidConfig {
            reason: "boom".to_string(),
        };
        ctx.record_failure("electron_range", &err);

        let entry = ctx
            .ledger()
            .entries_of(EvidenceKind::Failure)
            .next()
            .expect("failure entry should be present");
        assert!(entry.summary.starts_with("electron_range rejected mode=strict"));
        assert!(entry.summary.contains("boom"));
    }

    #[test]
    fn ledger_exports_one_json_object_per_line() {
        let mut ctx = RuntimeContext::new(DispatchConfig::default());
        ctx.ledger_mut().record(EvidenceKind::Normalization, "lossy");
        let jsonl = ctx.ledger().to_jsonl().expect("export should succeed");

        let parsed: Vec<EvidenceEntry> = jsonl
            .lines()
            .map(|line| serde_json::from_str(line).expect("each line is one entry"))
            .collect();
        assert_eq!(parsed.as_slice(), ctx.ledger().entries());
        assert!(jsonl.contains("\"kind\":\"normalization\""));
    }

    #[test]
    fn config_defaults_match_documented_values() {
        let config = DispatchConfig::default();
        assert_eq!(config.mode, ExecutionMode::Strict);
        assert_eq!(config.default_material, 1);
        assert_eq!(config.default_model, "tabata");
        assert_eq!(config.max_output_elements, DEFAULT_MAX_OUTPUT_ELEMENTS);

        let parsed = DispatchConfig::from_json("{}").expect("empty object takes defaults");
        assert_eq!(parsed, config);
    }

    #[test]
    fn config_parses_partial_overrides() {
        let config = DispatchConfig::from_json(r#"{"mode":"hardened","max_output_elements":64}"#)
            .expect("partial config should parse");
        assert_eq!(config.mode, ExecutionMode::Hardened);
        assert_eq!(config.max_output_elements, 64);
        assert_eq!(config.default_model, "tabata");
    }

    #[test]
    fn config_rejects_unknown_fields_and_zero_limit() {
        let err = DispatchConfig::from_json(r#"{"mode":"strict","cache":true}"#)
            .expect_err("unknown field must fail");
        assert_eq!(
            err,
            RuntimeError::UnknownField {
                field: "cache".to_string(),
            }
        );

        let err = DispatchConfig::from_json(r#"{"max_output_elements":0}"#)
            .expect_err("zero limit must fail");
        assert!(matches!(err, RuntimeError::InvalidConfig { .. }));

        let err = DispatchConfig::from_json(r#"{"mode":"lenient"}"#)
            .expect_err("unknown mode must fail");
        assert!(matches!(err, RuntimeError::InvalidConfig { .. }));
    }

    proptest! {
        #[test]
        fn prop_config_json_round_trip(
            hardened in any::<bool>(),
            material in 1i64..100,
            limit in 1usize..1_000_000,
        ) {
            let mode = if hardened { ExecutionMode::Hardened } else { ExecutionMode::Strict };
            let config = DispatchConfig {
                default_material: material,
                ..DispatchConfig::default()
            }
            .with_mode(mode)
            .with_max_output_elements(limit);
            let json = config.to_json().expect("config should encode");
            let back = DispatchConfig::from_json(&json).expect("config should decode");
            prop_assert_eq!(back, config);
        }
    }
}
