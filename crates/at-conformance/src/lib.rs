#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use at_api::{AmtrackSession, ApiError};
use at_broadcast::BroadcastError;
use at_core::{ArgumentError, ExecutionMode};
use at_dispatch::{CallOutput, DispatchError};
use at_registry::{RegistryError, Selector};
use at_runtime::{DispatchConfig, EvidenceKind};
use at_serialize::{DecodeMode, decode_call_request};
use serde::Deserialize;
use serde_json::Value;

const MAX_FIXTURE_BYTES: u64 = 1_048_576;
const DEFAULT_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    pub strict_mode: bool,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            strict_mode: true,
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixture_count: usize,
    pub strict_mode: bool,
    pub cases_total: usize,
    pub cases_passed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchCaseReport {
    pub name: String,
    pub mode: ExecutionMode,
    pub kind_ok: bool,
    pub shape_ok: bool,
    pub values_ok: bool,
    pub cells_ok: bool,
    pub error_ok: bool,
    pub evidence_ok: bool,
    pub detail: String,
}

impl DispatchCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.kind_ok
            && self.shape_ok
            && self.values_ok
            && self.cells_ok
            && self.error_ok
            && self.evidence_ok
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistryCaseReport {
    pub name: String,
    pub mode: ExecutionMode,
    pub resolved_ids: Vec<Option<i64>>,
    pub resolve_ok: bool,
    pub error_ok: bool,
}

impl RegistryCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.resolve_ok && self.error_ok
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DispatchFixtureFile {
    cases: Vec<DispatchCase>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DispatchCase {
    name: String,
    request: Value,
    expected_kind: Option<String>,
    expected_shape: Option<Vec<usize>>,
    /// `null` entries stand for NaN.
    expected_values: Option<Vec<Option<f64>>>,
    #[serde(default)]
    expected_increasing: bool,
    expected_error: Option<String>,
    tolerance: Option<f64>,
    #[serde(default)]
    cells: Vec<CellCheck>,
    #[serde(default)]
    strict_only: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CellCheck {
    index: Vec<usize>,
    direct: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistryFixtureFile {
    cases: Vec<RegistryCase>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistryCase {
    name: String,
    domain: String,
    selectors: Vec<Value>,
    expected_id: Option<i64>,
    expected_error: Option<String>,
}

#[must_use]
pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    let fixture_count = fs::read_dir(&config.fixture_root)
        .ok()
        .into_iter()
        .flat_map(|it| it.filter_map(Result::ok))
        .count();

    let mode = if config.strict_mode {
        ExecutionMode::Strict
    } else {
        ExecutionMode::Hardened
    };

    let (dispatch_total, dispatch_passed) = run_dispatch_conformance(config, mode)
        .map_or((0, 0), |(_, cases)| {
            summarize_passes(cases.iter().map(DispatchCaseReport::passed))
        });
    let (registry_total, registry_passed) = run_registry_conformance(config, mode)
        .map_or((0, 0), |(_, cases)| {
            summarize_passes(cases.iter().map(RegistryCaseReport::passed))
        });

    HarnessReport {
        suite: "smoke",
        fixture_count,
        strict_mode: config.strict_mode,
        cases_total: dispatch_total + registry_total,
        cases_passed: dispatch_passed + registry_passed,
    }
}

pub fn run_dispatch_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<DispatchCaseReport>), String> {
    let fixture_path = config.fixture_root.join("dispatch_cases.json");
    let fixture: DispatchFixtureFile = load_fixture(&fixture_path)?;

    let mut case_reports = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        if case.strict_only && mode != ExecutionMode::Strict {
            continue;
        }
        case_reports.push(run_dispatch_case(case, mode)?);
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(DispatchCaseReport::passed));
    let report = HarnessReport {
        suite: "dispatch",
        fixture_count: 1,
        strict_mode: mode == ExecutionMode::Strict,
        cases_total,
        cases_passed,
    };
    Ok((report, case_reports))
}

pub fn run_registry_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<RegistryCaseReport>), String> {
    let fixture_path = config.fixture_root.join("registry_cases.json");
    let fixture: RegistryFixtureFile = load_fixture(&fixture_path)?;
    let session = new_session(mode)?;

    let mut case_reports = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        case_reports.push(run_registry_case(&session, case, mode)?);
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(RegistryCaseReport::passed));
    let report = HarnessReport {
        suite: "registry",
        fixture_count: 1,
        strict_mode: mode == ExecutionMode::Strict,
        cases_total,
        cases_passed,
    };
    Ok((report, case_reports))
}

fn run_dispatch_case(
    case: &DispatchCase,
    mode: ExecutionMode,
) -> Result<DispatchCaseReport, String> {
    let mut session = new_session(mode)?;
    let payload = case.request.to_string();
    let request = decode_call_request(&payload, DecodeMode::Strict)
        .map_err(|error| format!("case '{}' has an undecodable request: {error}", case.name))?
        .request;
    let result = session.execute_request(request);
    let last_kind = session.evidence().last().map(|entry| entry.kind);

    let mut report = DispatchCaseReport {
        name: case.name.clone(),
        mode,
        kind_ok: true,
        shape_ok: true,
        values_ok: true,
        cells_ok: true,
        error_ok: true,
        evidence_ok: true,
        detail: String::new(),
    };

    let output = match (result, case.expected_error.as_deref()) {
        (Ok(output), None) => output,
        (Ok(output), Some(expected)) => {
            report.error_ok = false;
            report.detail = format!(
                "expected {expected}, got {} output of shape {:?}",
                output.kind().label(),
                output.shape()
            );
            return Ok(report);
        }
        (Err(error), expected) => {
            let actual = error_code(&error);
            report.error_ok = expected == Some(actual);
            report.evidence_ok = last_kind == Some(EvidenceKind::Failure);
            report.detail = format!("error={actual}: {error}");
            return Ok(report);
        }
    };

    report.evidence_ok = last_kind == Some(EvidenceKind::Dispatch);
    if let Some(kind) = case.expected_kind.as_deref() {
        report.kind_ok = output.kind().label() == kind;
    }
    if let Some(shape) = &case.expected_shape {
        report.shape_ok = &output.shape() == shape;
    }

    let flat = output.to_flat();
    let tolerance = case.tolerance.unwrap_or(DEFAULT_TOLERANCE);
    if let Some(expected) = &case.expected_values {
        report.values_ok = flat.len() == expected.len()
            && flat
                .iter()
                .zip(expected.iter())
                .all(|(actual, expected)| match expected {
                    Some(expected) => within(*actual, *expected, tolerance),
                    None => actual.is_nan(),
                });
    }
    if case.expected_increasing {
        report.values_ok = report.values_ok
            && flat.iter().all(|value| value.is_finite())
            && flat.windows(2).all(|pair| pair[0] < pair[1]);
    }

    for cell in &case.cells {
        let direct_payload = cell.direct.to_string();
        let direct_request = decode_call_request(&direct_payload, DecodeMode::Strict)
            .map_err(|error| format!("case '{}' has an undecodable cell: {error}", case.name))?
            .request;
        let direct = session
            .execute_request(direct_request)
            .map_err(|error| format!("case '{}' direct call failed: {error}", case.name))?;
        let matches = match (cell_value(&output, &cell.index), direct.as_scalar()) {
            (Some(actual), Some(expected)) => actual.to_bits() == expected.to_bits(),
            _ => false,
        };
        if !matches {
            report.cells_ok = false;
            report.detail = format!("cell {:?} differs from the direct call", cell.index);
        }
    }

    Ok(report)
}

fn run_registry_case(
    session: &AmtrackSession,
    case: &RegistryCase,
    mode: ExecutionMode,
) -> Result<RegistryCaseReport, String> {
    let mut resolved_ids = Vec::with_capacity(case.selectors.len());
    let mut errors = Vec::new();
    for raw in &case.selectors {
        let selector = selector_from_value(raw)
            .ok_or_else(|| format!("case '{}' has an unreadable selector {raw}", case.name))?;
        let resolved = match case.domain.as_str() {
            "material" => session.material(selector).map(|material| material.id),
            "particle" => session.particle(selector).map(|particle| particle.id),
            "model" => session.model(selector).map(|model| model.id),
            other => return Err(format!("unsupported domain '{other}'")),
        };
        match resolved {
            Ok(id) => resolved_ids.push(Some(id)),
            Err(error) => {
                resolved_ids.push(None);
                errors.push(error_code(&error));
            }
        }
    }

    let resolve_ok = match case.expected_id {
        Some(expected) => resolved_ids.iter().all(|id| *id == Some(expected)),
        None => resolved_ids.iter().all(Option::is_none),
    };
    let error_ok = match case.expected_error.as_deref() {
        Some(expected) => !errors.is_empty() && errors.iter().all(|code| *code == expected),
        None => errors.is_empty(),
    };

    Ok(RegistryCaseReport {
        name: case.name.clone(),
        mode,
        resolved_ids,
        resolve_ok,
        error_ok,
    })
}

fn new_session(mode: ExecutionMode) -> Result<AmtrackSession, String> {
    AmtrackSession::new(DispatchConfig::default().with_mode(mode))
        .map_err(|error| format!("session setup failed: {error}"))
}

fn selector_from_value(value: &Value) -> Option<Selector> {
    match value {
        Value::Number(number) => number.as_i64().map(Selector::Id),
        Value::String(name) => Some(Selector::Name(name.clone())),
        Value::Object(map) => map
            .get("opaque")
            .and_then(Value::as_str)
            .map(|type_name| Selector::Unsupported {
                type_name: type_name.to_string(),
            }),
        _ => None,
    }
}

fn cell_value(output: &CallOutput, index: &[usize]) -> Option<f64> {
    match output {
        CallOutput::Scalar(value) => index.is_empty().then_some(*value),
        CallOutput::Array(array) => array.get(index),
        CallOutput::List(root) => {
            let mut node = root;
            for position in index {
                node = node.children().get(*position)?;
            }
            node.as_leaf()
        }
    }
}

/// Stable snake_case code per failure kind.
#[must_use]
pub fn error_code(error: &ApiError) -> &'static str {
    match error {
        ApiError::Dispatch(DispatchError::Argument(argument)) => match argument {
            ArgumentError::InvalidArgumentType { .. } => "invalid_argument_type",
            ArgumentError::NonNumericElement { .. } => "non_numeric_element",
            ArgumentError::InvalidSelectorType { .. } => "invalid_selector_type",
            ArgumentError::UnknownIdentifier { .. } => "unknown_identifier",
            ArgumentError::ShapeDataMismatch { .. } => "shape_data_mismatch",
            ArgumentError::PrecisionLoss { .. } => "precision_loss",
            ArgumentError::Registry(_) => "registry",
        },
        ApiError::Dispatch(DispatchError::Broadcast(BroadcastError::IncompatibleShapes {
            ..
        })) => "incompatible_shapes",
        ApiError::Dispatch(DispatchError::Broadcast(BroadcastError::ShapeOverflow { .. })) => {
            "shape_overflow"
        }
        ApiError::Dispatch(DispatchError::ArityMismatch { .. }) => "arity_mismatch",
        ApiError::Dispatch(DispatchError::OutputTooLarge { .. }) => "output_too_large",
        ApiError::Registry(RegistryError::UnknownIdentifier { .. }) => "unknown_identifier",
        ApiError::Registry(RegistryError::InvalidSelectorType { .. }) => "invalid_selector_type",
        ApiError::Registry(_) => "registry",
        ApiError::Config(_) => "config",
        ApiError::Wire(_) => "wire",
    }
}

fn load_fixture<T>(path: &Path) -> Result<T, String>
where
    T: for<'de> Deserialize<'de>,
{
    let metadata = fs::metadata(path).map_err(|error| {
        format!(
            "failed reading fixture metadata {}: {error}",
            path.display()
        )
    })?;
    let size = metadata.len();
    if size > MAX_FIXTURE_BYTES {
        return Err(format!(
            "fixture {} exceeds max bytes: actual={size} max={MAX_FIXTURE_BYTES}",
            path.display()
        ));
    }

    let raw = fs::read_to_string(path)
        .map_err(|error| format!("failed reading fixture {}: {error}", path.display()))?;
    serde_json::from_str::<T>(&raw)
        .map_err(|error| format!("failed parsing fixture {}: {error}", path.display()))
}

fn summarize_passes<I>(iter: I) -> (usize, usize)
where
    I: Iterator<Item = bool>,
{
    let mut total = 0usize;
    let mut passed = 0usize;
    for is_passed in iter {
        total += 1;
        if is_passed {
            passed += 1;
        }
    }
    (total, passed)
}

fn within(actual: f64, expected: f64, tolerance: f64) -> bool {
    (actual - expected).abs() <= tolerance
}
