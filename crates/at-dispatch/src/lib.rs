#![forbid(unsafe_code)]

use std::fmt;

use at_broadcast::{BroadcastError, BroadcastMode, BroadcastPlan, plan_arguments};
use at_core::{ArgumentError, ArgumentValues, CanonicalArgument, OriginKind};
use at_kernel::{KernelInput, ScalarKernel};
use at_registry::{Domain, Registry, RegistryError, Selector};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchDecision {
    pub kernel: &'static str,
    pub broadcast: BroadcastMode,
    pub output_shape: Vec<usize>,
    pub invocations: usize,
    pub result_kind: OriginKind,
    pub lossy_integers: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub output: CallOutput,
    pub decision: DispatchDecision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    Argument(ArgumentError),
    Broadcast(BroadcastError),
    ArityMismatch {
        kernel: &'static str,
        expected: usize,
        actual: usize,
    },
    OutputTooLarge {
        elements: usize,
        limit: usize,
    },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Argument(error) => write!(f, "argument failure: {error}"),
            Self::Broadcast(error) => write!(f, "broadcast failure: {error}"),
            Self::ArityMismatch {
                kernel,
                expected,
                actual,
            } => write!(
                f,
                "kernel {kernel} takes {expected} arguments, got {actual}"
            ),
            Self::OutputTooLarge { elements, limit } => write!(
                f,
                "output of {elements} elements exceeds limit of {limit}"
            ),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<ArgumentError> for DispatchError {
    fn from(value: ArgumentError) -> Self {
        Self::Argument(value)
    }
}

impl From<BroadcastError> for DispatchError {
    fn from(value: BroadcastError) -> Self {
        Self::Broadcast(value)
    }
}

impl From<RegistryError> for DispatchError {
    fn from(value: RegistryError) -> Self {
        Self::Argument(value.into())
    }
}

/// Nested-list node; the root of a list result is always a `Branch`.
#[derive(Debug, Clone, PartialEq)]
pub enum ListNode {
    Leaf(f64),
    Branch(Vec<ListNode>),
}

impl ListNode {
    #[must_use]
    pub fn as_leaf(&self) -> Option<f64> {
        match self {
            Self::Leaf(value) => Some(*value),
            Self::Branch(_) => None,
        }
    }

    #[must_use]
    pub fn children(&self) -> &[ListNode] {
        match self {
            Self::Leaf(_) => &[],
            Self::Branch(children) => children,
        }
    }

    fn flatten_into(&self, out: &mut Vec<f64>) {
        match self {
            Self::Leaf(value) => out.push(*value),
            Self::Branch(children) => {
                for child in children {
                    child.flatten_into(out);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DenseArray {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl DenseArray {
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Element at a full coordinate.
    #[must_use]
    pub fn get(&self, index: &[usize]) -> Option<f64> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut flat = 0usize;
        for (idx, dim) in index.iter().zip(self.shape.iter()) {
            if idx >= dim {
                return None;
            }
            flat = flat * dim + idx;
        }
        self.data.get(flat).copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallOutput {
    Scalar(f64),
    List(ListNode),
    Array(DenseArray),
}

impl CallOutput {
    #[must_use]
    pub fn kind(&self) -> OriginKind {
        match self {
            Self::Scalar(_) => OriginKind::Scalar,
            Self::List(_) => OriginKind::List,
            Self::Array(_) => OriginKind::Array,
        }
    }

    #[must_use]
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Self::Scalar(_) => Vec::new(),
            Self::List(root) => {
                let mut shape = Vec::new();
                let mut node = root;
                while let ListNode::Branch(children) = node {
                    shape.push(children.len());
                    match children.first() {
                        Some(first) => node = first,
                        None => break,
                    }
                }
                shape
            }
            Self::Array(array) => array.shape().to_vec(),
        }
    }

    /// Row-major values regardless of container kind.
    #[must_use]
    pub fn to_flat(&self) -> Vec<f64> {
        match self {
            Self::Scalar(value) => vec![*value],
            Self::List(root) => {
                let mut out = Vec::new();
                root.flatten_into(&mut out);
                out
            }
            Self::Array(array) => array.data().to_vec(),
        }
    }
}

/// Richest origin among numeric arguments; selectors never widen the result.
#[must_use]
pub fn result_kind(arguments: &[CanonicalArgument]) -> OriginKind {
    arguments
        .iter()
        .filter(|argument| !argument.is_selector())
        .map(CanonicalArgument::origin)
        .max()
        .unwrap_or(OriginKind::Scalar)
}

#[must_use]
pub fn materialize(kind: OriginKind, shape: &[usize], data: Vec<f64>) -> CallOutput {
    if shape.is_empty() && kind != OriginKind::Array {
        return CallOutput::Scalar(data.first().copied().unwrap_or(f64::NAN));
    }
    match kind {
        OriginKind::List => CallOutput::List(ListNode::Branch(nest(shape, &data))),
        OriginKind::Scalar | OriginKind::Array => CallOutput::Array(DenseArray {
            shape: shape.to_vec(),
            data,
        }),
    }
}

fn nest(shape: &[usize], data: &[f64]) -> Vec<ListNode> {
    match shape {
        [] => Vec::new(),
        [_] => data.iter().copied().map(ListNode::Leaf).collect(),
        [_, inner @ ..] => {
            let chunk = inner.iter().product::<usize>();
            if chunk == 0 {
                return Vec::new();
            }
            data.chunks(chunk)
                .map(|block| ListNode::Branch(nest(inner, block)))
                .collect()
        }
    }
}

/// Runs one kernel invocation per output position of `plan`, in row-major
/// order. Container selectors are resolved at the position that first needs
/// them; an unknown identifier aborts the whole call.
pub fn execute(
    plan: &BroadcastPlan,
    arguments: &[CanonicalArgument],
    kernel: &dyn ScalarKernel,
    registry: &Registry,
) -> Result<Vec<f64>, DispatchError> {
    if arguments.len() != kernel.arity() {
        return Err(DispatchError::ArityMismatch {
            kernel: kernel.name(),
            expected: kernel.arity(),
            actual: arguments.len(),
        });
    }

    let mut resolved: Vec<Vec<Option<i64>>> = arguments
        .iter()
        .map(|argument| match argument.values() {
            ArgumentValues::Numeric(_) => Vec::new(),
            ArgumentValues::Selector { keys, .. } => vec![None; keys.len()],
        })
        .collect();
    let mut inputs = Vec::with_capacity(arguments.len());
    let mut output = Vec::with_capacity(plan.output_len());

    plan.for_each_position(|_, locals| {
        inputs.clear();
        for ((argument, local), cache) in arguments
            .iter()
            .zip(locals.iter().copied())
            .zip(resolved.iter_mut())
        {
            let input = match argument.values() {
                ArgumentValues::Numeric(values) => KernelInput::Number(values[local]),
                ArgumentValues::Selector { domain, keys } => {
                    let cached = cache[local];
                    let id = match cached {
                        Some(id) => id,
                        None => {
                            let id = selector_id(registry, *domain, &keys[local])?;
                            cache[local] = Some(id);
                            id
                        }
                    };
                    KernelInput::Id(id)
                }
            };
            inputs.push(input);
        }
        output.push(kernel.evaluate(&inputs));
        Ok::<(), DispatchError>(())
    })?;

    Ok(output)
}

fn selector_id(
    registry: &Registry,
    domain: Domain,
    key: &Selector,
) -> Result<i64, DispatchError> {
    match key {
        Selector::Entry(entry) if entry.domain() == domain => Ok(entry.id()),
        other => Ok(registry.resolve_id(domain, other)?),
    }
}

/// Plans, executes and materializes one call over canonical arguments.
pub fn dispatch(
    arguments: &[CanonicalArgument],
    broadcast: BroadcastMode,
    kernel: &dyn ScalarKernel,
    registry: &Registry,
    max_output_elements: usize,
) -> Result<DispatchOutcome, DispatchError> {
    let plan = plan_arguments(arguments, broadcast)?;
    if plan.output_len() > max_output_elements {
        return Err(DispatchError::OutputTooLarge {
            elements: plan.output_len(),
            limit: max_output_elements,
        });
    }

    let data = execute(&plan, arguments, kernel, registry)?;
    let kind = result_kind(arguments);
    let invocations = data.len();
    let output = materialize(kind, plan.output_shape(), data);

    Ok(DispatchOutcome {
        decision: DispatchDecision {
            kernel: kernel.name(),
            broadcast,
            output_shape: plan.output_shape().to_vec(),
            invocations,
            result_kind: output.kind(),
            lossy_integers: arguments.iter().map(CanonicalArgument::lossy_integers).sum(),
        },
        output,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use at_broadcast::BroadcastMode;
    use at_core::{
        ArgumentError, CanonicalArgument, Element, ExecutionMode, NdArray, NumericInput,
        OriginKind, normalize_numeric, normalize_selector,
    };
    use at_kernel::{ElectronRangeKernel, KernelInput, ScalarKernel};
    use at_registry::{Domain, Registry};
    use proptest::prelude::*;

    use super::{CallOutput, DispatchError, ListNode, dispatch, materialize};

    const NO_LIMIT: usize = usize::MAX;

    struct CountingKernel {
        calls: AtomicUsize,
    }

    impl CountingKernel {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ScalarKernel for CountingKernel {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn arity(&self) -> usize {
            2
        }

        fn evaluate(&self, inputs: &[KernelInput]) -> f64 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let lhs = inputs[0].as_number().unwrap_or(f64::NAN);
            let rhs = match inputs[1] {
                KernelInput::Number(value) => value,
                KernelInput::Id(id) => id as f64,
            };
            lhs * 100.0 + rhs
        }
    }

    fn registry() -> Registry {
        Registry::builtin().expect("builtin registry should build")
    }

    fn num(input: NumericInput) -> CanonicalArgument {
        normalize_numeric(&input, ExecutionMode::Strict).expect("numeric input should normalize")
    }

    fn sel(input: NumericInput, domain: Domain, registry: &Registry) -> CanonicalArgument {
        normalize_selector(&input, domain, registry).expect("selector input should normalize")
    }

    fn det_seed(parts: &[u64]) -> u64 {
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        for value in parts {
            for byte in value.to_le_bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
        }
        hash
    }

    fn build_property_log(test_id: &str, seed: u64, reason_code: &str) -> BTreeMap<String, String> {
        let mut log = BTreeMap::new();
        log.insert("suite_id".to_string(), "at_dispatch_property".to_string());
        log.insert("test_id".to_string(), test_id.to_string());
        log.insert("seed".to_string(), seed.to_string());
        log.insert(
            "replay_command".to_string(),
            format!("cargo test -p at-dispatch {test_id} -- --nocapture"),
        );
        log.insert("outcome".to_string(), "pass".to_string());
        log.insert("reason_code".to_string(), reason_code.to_string());
        log
    }

    fn assert_log_contract(log: &BTreeMap<String, String>) {
        for key in [
            "suite_id",
            "test_id",
            "seed",
            "replay_command",
            "outcome",
            "reason_code",
        ] {
            assert!(log.contains_key(key), "property log missing key '{key}'");
        }
    }

    #[test]
    fn element_wise_list_keeps_list_kind() {
        let registry = registry();
        let kernel = ElectronRangeKernel::from_registry(&registry);
        let arguments = [
            num(NumericInput::from_sequence([10.0, 50.0, 100.0])),
            sel(NumericInput::from_scalar(1), Domain::Materials, &registry),
            sel(NumericInput::from_scalar("tabata"), Domain::Models, &registry),
        ];
        let outcome = dispatch(
            &arguments,
            BroadcastMode::ElementWise,
            &kernel,
            &registry,
            NO_LIMIT,
        )
        .expect("element-wise call should succeed");

        assert_eq!(outcome.output.kind(), OriginKind::List);
        assert_eq!(outcome.output.shape(), vec![3]);
        let values = outcome.output.to_flat();
        assert!(values.iter().all(|value| value.is_finite()));
        assert!(values.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(outcome.decision.invocations, 3);
        assert_eq!(outcome.decision.kernel, "electron_range");
    }

    #[test]
    fn cartesian_positions_match_direct_calls() {
        let registry = registry();
        let kernel = ElectronRangeKernel::from_registry(&registry);
        let energies = [15.0, 120.0];
        let materials = [1i64, 3, 7];
        let models = ["tabata", "geiss", "butts_katz", "waligorski"];
        let arguments = [
            num(NumericInput::from_sequence(energies)),
            sel(NumericInput::from_sequence(materials), Domain::Materials, &registry),
            sel(NumericInput::from_sequence(models), Domain::Models, &registry),
        ];
        let outcome = dispatch(
            &arguments,
            BroadcastMode::CartesianProduct,
            &kernel,
            &registry,
            NO_LIMIT,
        )
        .expect("cartesian call should succeed");
        assert_eq!(outcome.output.shape(), vec![2, 3, 4]);
        assert_eq!(outcome.decision.invocations, 24);

        let CallOutput::List(root) = &outcome.output else {
            panic!("list energies must give a list result");
        };
        let model_ids = [7i64, 4, 2, 3];
        for (i, energy) in energies.iter().enumerate() {
            for (j, material) in materials.iter().enumerate() {
                for (k, model) in model_ids.iter().enumerate() {
                    let cell = root.children()[i].children()[j].children()[k]
                        .as_leaf()
                        .expect("innermost nodes are leaves");
                    assert_eq!(cell, kernel.range_m(*energy, *material, *model));
                }
            }
        }
    }

    #[test]
    fn empty_plan_never_calls_kernel() {
        let registry = registry();
        let kernel = CountingKernel::new();
        let arguments = [
            num(NumericInput::from_array(NdArray::vector_f64(Vec::new()))),
            num(NumericInput::from_sequence([1.0, 2.0])),
        ];
        let outcome = dispatch(
            &arguments,
            BroadcastMode::CartesianProduct,
            &kernel,
            &registry,
            NO_LIMIT,
        )
        .expect("empty cartesian call should succeed");
        assert_eq!(kernel.calls(), 0);
        assert_eq!(outcome.output.kind(), OriginKind::Array);
        assert_eq!(outcome.output.shape(), vec![0]);
        assert!(outcome.output.to_flat().is_empty());
    }

    #[test]
    fn unknown_container_selector_aborts_whole_call() {
        let registry = registry();
        let kernel = CountingKernel::new();
        let arguments = [
            num(NumericInput::from_sequence([1.0, 2.0, 3.0])),
            sel(
                NumericInput::from_sequence(["water_liquid", "air", "not_a_material"]),
                Domain::Materials,
                &registry,
            ),
        ];
        let err = dispatch(
            &arguments,
            BroadcastMode::ElementWise,
            &kernel,
            &registry,
            NO_LIMIT,
        )
        .expect_err("unknown name must abort");
        assert!(matches!(
            err,
            DispatchError::Argument(ArgumentError::UnknownIdentifier {
                domain: Domain::Materials,
                ..
            })
        ));
        assert_eq!(kernel.calls(), 2);
    }

    #[test]
    fn container_selectors_resolve_each_key_once_per_call() {
        let registry = registry();
        let kernel = CountingKernel::new();
        let arguments = [
            num(NumericInput::from_sequence([1.0, 2.0])),
            sel(NumericInput::from_sequence(["air", "gold"]), Domain::Materials, &registry),
        ];
        let outcome = dispatch(
            &arguments,
            BroadcastMode::CartesianProduct,
            &kernel,
            &registry,
            NO_LIMIT,
        )
        .expect("cartesian call should succeed");
        assert_eq!(outcome.output.to_flat(), vec![107.0, 110.0, 207.0, 210.0]);
    }

    #[test]
    fn oversized_plan_is_rejected_before_kernel_calls() {
        let registry = registry();
        let kernel = CountingKernel::new();
        let arguments = [
            num(NumericInput::from_sequence(vec![1.0; 10])),
            num(NumericInput::from_sequence(vec![1.0; 10])),
        ];
        let err = dispatch(
            &arguments,
            BroadcastMode::CartesianProduct,
            &kernel,
            &registry,
            50,
        )
        .expect_err("100 elements exceed limit 50");
        assert_eq!(
            err,
            DispatchError::OutputTooLarge {
                elements: 100,
                limit: 50,
            }
        );
        assert_eq!(kernel.calls(), 0);
    }

    #[test]
    fn incompatible_shapes_surface_as_broadcast_error() {
        let registry = registry();
        let kernel = CountingKernel::new();
        let arguments = [
            num(NumericInput::from_sequence([1.0, 2.0, 3.0])),
            num(NumericInput::from_sequence([1.0, 2.0, 3.0, 4.0])),
        ];
        let err = dispatch(
            &arguments,
            BroadcastMode::ElementWise,
            &kernel,
            &registry,
            NO_LIMIT,
        )
        .expect_err("(3,) vs (4,) must fail");
        assert!(matches!(err, DispatchError::Broadcast(_)));
        assert_eq!(kernel.calls(), 0);
    }

    #[test]
    fn arity_mismatch_is_rejected() {
        let registry = registry();
        let kernel = CountingKernel::new();
        let arguments = [num(NumericInput::from_scalar(1.0))];
        let err = dispatch(
            &arguments,
            BroadcastMode::ElementWise,
            &kernel,
            &registry,
            NO_LIMIT,
        )
        .expect_err("one argument for a binary kernel must fail");
        assert!(matches!(
            err,
            DispatchError::ArityMismatch {
                expected: 2,
                actual: 1,
                ..
            }
        ));
    }

    #[test]
    fn scalar_inputs_with_selector_container_materialize_as_array() {
        let registry = registry();
        let kernel = CountingKernel::new();
        let arguments = [
            num(NumericInput::from_scalar(Element::Float(5.0))),
            sel(NumericInput::from_sequence([1i64, 2]), Domain::Materials, &registry),
        ];
        let outcome = dispatch(
            &arguments,
            BroadcastMode::ElementWise,
            &kernel,
            &registry,
            NO_LIMIT,
        )
        .expect("selector container call should succeed");
        let CallOutput::Array(array) = &outcome.output else {
            panic!("selector-only containers give an array");
        };
        assert_eq!(array.shape(), &[2]);
        assert_eq!(array.get(&[1]), Some(502.0));
        assert_eq!(array.get(&[2]), None);
    }

    #[test]
    fn scalar_call_returns_scalar() {
        let registry = registry();
        let kernel = CountingKernel::new();
        let arguments = [
            num(NumericInput::from_scalar(1.0)),
            num(NumericInput::from_array(NdArray::zero_dim_f64(2.0))),
        ];
        let outcome = dispatch(
            &arguments,
            BroadcastMode::ElementWise,
            &kernel,
            &registry,
            NO_LIMIT,
        )
        .expect("scalar call should succeed");
        assert_eq!(outcome.output, CallOutput::Scalar(102.0));
    }

    #[test]
    fn materializer_nests_lists_row_major() {
        let output = materialize(
            OriginKind::List,
            &[2, 3],
            vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0],
        );
        let CallOutput::List(root) = &output else {
            panic!("list kind expected");
        };
        assert_eq!(root.children().len(), 2);
        assert_eq!(root.children()[1].children()[0], ListNode::Leaf(3.0));
        assert_eq!(output.shape(), vec![2, 3]);

        let empty = materialize(OriginKind::List, &[0], Vec::new());
        assert_eq!(empty, CallOutput::List(ListNode::Branch(Vec::new())));
        assert_eq!(empty.shape(), vec![0]);

        let array = materialize(OriginKind::Array, &[], vec![4.0]);
        assert_eq!(array.kind(), OriginKind::Array);
        assert_eq!(array.as_scalar(), None);
    }

    proptest! {
        #[test]
        fn prop_cartesian_cell_equals_scalar_call(
            lhs in prop::collection::vec(-100.0f64..100.0, 1..5),
            rhs in prop::collection::vec(-100.0f64..100.0, 1..5),
        ) {
            let registry = registry();
            let kernel = CountingKernel::new();
            let arguments = [
                num(NumericInput::from_array(NdArray::vector_f64(lhs.clone()))),
                num(NumericInput::from_array(NdArray::vector_f64(rhs.clone()))),
            ];
            let outcome = dispatch(
                &arguments,
                BroadcastMode::CartesianProduct,
                &kernel,
                &registry,
                NO_LIMIT,
            )
            .expect("cartesian call should succeed");
            let CallOutput::Array(array) = &outcome.output else {
                panic!("array inputs give array output");
            };
            prop_assert_eq!(array.shape(), &[lhs.len(), rhs.len()]);
            for (i, a) in lhs.iter().enumerate() {
                for (j, b) in rhs.iter().enumerate() {
                    let direct = kernel.evaluate(&[KernelInput::Number(*a), KernelInput::Number(*b)]);
                    prop_assert_eq!(array.get(&[i, j]), Some(direct));
                }
            }

            let seed = det_seed(&[lhs.len() as u64, rhs.len() as u64]);
            let log = build_property_log(
                "prop_cartesian_cell_equals_scalar_call",
                seed,
                "cartesian_position_contract_ok",
            );
            assert_log_contract(&log);
        }
    }
}
