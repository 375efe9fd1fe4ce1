#![forbid(unsafe_code)]

use std::fmt;

use at_broadcast::BroadcastMode;
use at_core::{ExecutionMode, NumericInput, normalize_numeric, normalize_selector};
use at_dispatch::{CallOutput, DispatchDecision, DispatchError, DispatchOutcome, dispatch};
use at_kernel::{BetaFromEnergyKernel, ElectronRangeKernel, EnergyFromBetaKernel, ScalarKernel};
use at_registry::{
    Domain, Material, Model, Particle, Registry, RegistryEntry, RegistryError, Selector,
};
use at_runtime::{DispatchConfig, EvidenceEntry, EvidenceKind, RuntimeContext, RuntimeError};
use at_serialize::{
    CallOp, CallRequest, DecodeMode, SerializeError, decode_call_request, encode_output,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ApiError {
    Registry(RegistryError),
    Dispatch(DispatchError),
    Config(RuntimeError),
    Wire(SerializeError),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry(error) => write!(f, "registry failure: {error}"),
            Self::Dispatch(error) => write!(f, "dispatch failure: {error}"),
            Self::Config(error) => write!(f, "config failure: {error}"),
            Self::Wire(error) => write!(f, "wire failure: {error}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<RegistryError> for ApiError {
    fn from(value: RegistryError) -> Self {
        Self::Registry(value)
    }
}

impl From<DispatchError> for ApiError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

impl From<RuntimeError> for ApiError {
    fn from(value: RuntimeError) -> Self {
        Self::Config(value)
    }
}

impl From<SerializeError> for ApiError {
    fn from(value: SerializeError) -> Self {
        Self::Wire(value)
    }
}

/// Electron range call with optional selectors; missing ones fall back to
/// the session's configured defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct ElectronRangeCall {
    energy: NumericInput,
    material: Option<NumericInput>,
    model: Option<NumericInput>,
    cartesian_product: bool,
}

impl ElectronRangeCall {
    #[must_use]
    pub fn new(energy: impl Into<NumericInput>) -> Self {
        Self {
            energy: energy.into(),
            material: None,
            model: None,
            cartesian_product: false,
        }
    }

    #[must_use]
    pub fn material(mut self, material: impl Into<NumericInput>) -> Self {
        self.material = Some(material.into());
        self
    }

    #[must_use]
    pub fn model(mut self, model: impl Into<NumericInput>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn cartesian_product(mut self, cartesian_product: bool) -> Self {
        self.cartesian_product = cartesian_product;
        self
    }
}

#[derive(Debug, Clone)]
pub struct AmtrackSession {
    runtime: RuntimeContext,
    registry: &'static Registry,
    electron_range: ElectronRangeKernel,
}

impl AmtrackSession {
    /// Session over the process-wide registry.
    pub fn new(config: DispatchConfig) -> Result<Self, ApiError> {
        let registry = at_registry::registry()?;
        Self::with_registry(config, registry)
    }

    pub fn with_registry(
        config: DispatchConfig,
        registry: &'static Registry,
    ) -> Result<Self, ApiError> {
        config.validate()?;
        Ok(Self {
            runtime: RuntimeContext::new(config),
            registry,
            electron_range: ElectronRangeKernel::from_registry(registry),
        })
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.runtime.mode()
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.runtime.set_mode(mode);
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        self.runtime.config()
    }

    #[must_use]
    pub fn registry(&self) -> &'static Registry {
        self.registry
    }

    pub fn beta_from_energy(
        &mut self,
        energy: impl Into<NumericInput>,
    ) -> Result<CallOutput, ApiError> {
        let energy = energy.into();
        let outcome = self.convert(&energy, &BetaFromEnergyKernel);
        self.finish("beta_from_energy", outcome)
    }

    pub fn energy_from_beta(
        &mut self,
        beta: impl Into<NumericInput>,
    ) -> Result<CallOutput, ApiError> {
        let beta = beta.into();
        let outcome = self.convert(&beta, &EnergyFromBetaKernel);
        self.finish("energy_from_beta", outcome)
    }

    /// Electron range in meters over energies (MeV/u), material and model
    /// selectors.
    pub fn electron_range(
        &mut self,
        energy: impl Into<NumericInput>,
        material: impl Into<NumericInput>,
        model: impl Into<NumericInput>,
        cartesian_product: bool,
    ) -> Result<CallOutput, ApiError> {
        let energy = energy.into();
        let material = material.into();
        let model = model.into();
        let outcome = self.range(
            &energy,
            &material,
            &model,
            BroadcastMode::from_flag(cartesian_product),
        );
        self.finish("electron_range", outcome)
    }

    pub fn call_electron_range(&mut self, call: ElectronRangeCall) -> Result<CallOutput, ApiError> {
        let material = call
            .material
            .unwrap_or_else(|| NumericInput::from_scalar(self.config().default_material));
        let model = call
            .model
            .unwrap_or_else(|| NumericInput::from_scalar(self.config().default_model.clone()));
        self.electron_range(call.energy, material, model, call.cartesian_product)
    }

    pub fn material(&self, selector: impl Into<Selector>) -> Result<Material, ApiError> {
        let id = self.registry.resolve_id(Domain::Materials, &selector.into())?;
        Ok(self.registry.material(id)?.clone())
    }

    /// Particle by id, acronym, element name, isotope notation (`"12C"`) or
    /// descriptor.
    pub fn particle(&self, selector: impl Into<Selector>) -> Result<Particle, ApiError> {
        match self.registry.resolve(Domain::Particles, &selector.into())? {
            RegistryEntry::Particle(particle) => Ok(particle),
            other => Err(RegistryError::InvalidSelectorType {
                domain: Domain::Particles,
                type_name: other.domain().label().to_string(),
            }
            .into()),
        }
    }

    /// Particle from `1000 * Z + A`.
    pub fn particle_from_number(&self, particle_no: i64) -> Result<Particle, ApiError> {
        Ok(self.registry.particle_from_number(particle_no)?)
    }

    pub fn model(&self, selector: impl Into<Selector>) -> Result<Model, ApiError> {
        let id = self.registry.resolve_id(Domain::Models, &selector.into())?;
        Ok(self.registry.model(id)?.clone())
    }

    pub fn model_id(&self, name: &str) -> Result<i64, ApiError> {
        Ok(self
            .registry
            .resolve_by_name(Domain::Models, name)?
            .id())
    }

    #[must_use]
    pub fn material_ids(&self) -> Vec<i64> {
        self.registry.all_ids(Domain::Materials)
    }

    #[must_use]
    pub fn material_names(&self) -> Vec<String> {
        self.registry.all_names(Domain::Materials)
    }

    #[must_use]
    pub fn material_long_names(&self) -> Vec<String> {
        self.registry.all_long_names(Domain::Materials)
    }

    #[must_use]
    pub fn particle_names(&self) -> Vec<String> {
        self.registry.all_long_names(Domain::Particles)
    }

    #[must_use]
    pub fn particle_acronyms(&self) -> Vec<String> {
        self.registry.all_names(Domain::Particles)
    }

    #[must_use]
    pub fn model_names(&self) -> Vec<String> {
        self.registry.all_names(Domain::Models)
    }

    /// Runs a decoded wire request. Selectors missing from an
    /// `electron_range` request take the configured defaults.
    pub fn execute_request(&mut self, request: CallRequest) -> Result<CallOutput, ApiError> {
        let op = request.op;
        if op != CallOp::ElectronRange && (request.material.is_some() || request.model.is_some()) {
            let error = SerializeError::IncompatiblePayload {
                reason: format!("{} takes no material or model", op.label()),
            };
            self.runtime.record_failure(op.label(), &error);
            return Err(error.into());
        }

        let converted = request.input.into_numeric_input().and_then(|input| {
            let material = request.material.map(|m| m.into_numeric_input()).transpose()?;
            let model = request.model.map(|m| m.into_numeric_input()).transpose()?;
            Ok((input, material, model))
        });
        let (input, material, model) = match converted {
            Ok(parts) => parts,
            Err(error) => {
                self.runtime.record_failure(op.label(), &error);
                return Err(error.into());
            }
        };

        match op {
            CallOp::BetaFromEnergy => self.beta_from_energy(input),
            CallOp::EnergyFromBeta => self.energy_from_beta(input),
            CallOp::ElectronRange => {
                let mut call =
                    ElectronRangeCall::new(input).cartesian_product(request.cartesian_product);
                if let Some(material) = material {
                    call = call.material(material);
                }
                if let Some(model) = model {
                    call = call.model(model);
                }
                self.call_electron_range(call)
            }
        }
    }

    /// Decodes a JSON call request, runs it and encodes the result.
    pub fn execute_json(
        &mut self,
        payload: &str,
        decode_mode: DecodeMode,
    ) -> Result<serde_json::Value, ApiError> {
        let decoded = match decode_call_request(payload, decode_mode) {
            Ok(decoded) => decoded,
            Err(error) => {
                self.runtime.record_failure("decode", &error);
                return Err(error.into());
            }
        };
        if !decoded.ignored_fields.is_empty() {
            self.runtime.ledger_mut().record(
                EvidenceKind::Normalization,
                format!(
                    "op={} ignored_fields={:?}",
                    decoded.request.op.label(),
                    decoded.ignored_fields
                ),
            );
        }
        let output = self.execute_request(decoded.request)?;
        Ok(encode_output(&output))
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceEntry] {
        self.runtime.ledger().entries()
    }

    #[must_use]
    pub fn evidence_len(&self) -> usize {
        self.runtime.ledger().len()
    }

    pub fn evidence_jsonl(&self) -> Result<String, ApiError> {
        Ok(self.runtime.ledger().to_jsonl()?)
    }

    fn convert(
        &self,
        input: &NumericInput,
        kernel: &dyn ScalarKernel,
    ) -> Result<DispatchOutcome, DispatchError> {
        let argument = normalize_numeric(input, self.mode())?;
        dispatch(
            std::slice::from_ref(&argument),
            BroadcastMode::ElementWise,
            kernel,
            self.registry,
            self.config().max_output_elements,
        )
    }

    fn range(
        &self,
        energy: &NumericInput,
        material: &NumericInput,
        model: &NumericInput,
        broadcast: BroadcastMode,
    ) -> Result<DispatchOutcome, DispatchError> {
        let arguments = [
            normalize_numeric(energy, self.mode())?,
            normalize_selector(material, Domain::Materials, self.registry)?,
            normalize_selector(model, Domain::Models, self.registry)?,
        ];
        dispatch(
            &arguments,
            broadcast,
            &self.electron_range,
            self.registry,
            self.config().max_output_elements,
        )
    }

    fn finish(
        &mut self,
        op: &str,
        outcome: Result<DispatchOutcome, DispatchError>,
    ) -> Result<CallOutput, ApiError> {
        match outcome {
            Ok(outcome) => {
                self.record_dispatch(op, &outcome.decision);
                Ok(outcome.output)
            }
            Err(error) => {
                self.runtime.record_failure(op, &error);
                Err(error.into())
            }
        }
    }

    fn record_dispatch(&mut self, op: &str, decision: &DispatchDecision) {
        let mode = self.mode();
        if decision.lossy_integers > 0 {
            self.runtime.ledger_mut().record(
                EvidenceKind::Normalization,
                format!(
                    "op={op} mode={} lossy_integers={} above 2^53 upcast to f64",
                    mode.label(),
                    decision.lossy_integers
                ),
            );
        }
        self.runtime.ledger_mut().record(
            EvidenceKind::Dispatch,
            format!(
                "op={op} mode={} kernel={} broadcast={} shape={:?} invocations={} result={}",
                mode.label(),
                decision.kernel,
                decision.broadcast.label(),
                decision.output_shape,
                decision.invocations,
                decision.result_kind.label()
            ),
        );
    }
}
