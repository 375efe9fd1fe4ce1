#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use at_registry::{Domain, Registry};

/// Atomic mass unit, MeV/c^2.
pub const ATOMIC_MASS_UNIT_MEV: f64 = 931.494_028;
/// Electron rest energy, MeV.
pub const ELECTRON_MASS_MEV: f64 = 0.510_998_950;
/// Electron mass in atomic mass units.
pub const ELECTRON_MASS_U: f64 = 0.000_548_579_909;

/// One fully resolved kernel input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelInput {
    Number(f64),
    Id(i64),
}

impl KernelInput {
    #[must_use]
    pub fn as_number(self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(value),
            Self::Id(_) => None,
        }
    }

    #[must_use]
    pub fn as_id(self) -> Option<i64> {
        match self {
            Self::Id(id) => Some(id),
            Self::Number(_) => None,
        }
    }
}

/// Pure single-value computation. Physically invalid input yields NaN rather
/// than an error, and so does an input list of the wrong arity or kind.
pub trait ScalarKernel: Sync {
    fn name(&self) -> &'static str;

    fn arity(&self) -> usize;

    fn evaluate(&self, inputs: &[KernelInput]) -> f64;
}

#[must_use]
pub fn lorentz_gamma_from_energy(energy_mev_u: f64) -> f64 {
    1.0 + energy_mev_u / ATOMIC_MASS_UNIT_MEV
}

#[must_use]
pub fn beta_from_energy(energy_mev_u: f64) -> f64 {
    if energy_mev_u.is_nan() || energy_mev_u < 0.0 {
        return f64::NAN;
    }
    let gamma = lorentz_gamma_from_energy(energy_mev_u);
    (1.0 - 1.0 / (gamma * gamma)).sqrt()
}

#[must_use]
pub fn energy_from_beta(beta: f64) -> f64 {
    if !(0.0..=1.0).contains(&beta) {
        return f64::NAN;
    }
    if beta == 1.0 {
        return f64::INFINITY;
    }
    let gamma = 1.0 / (1.0 - beta * beta).sqrt();
    (gamma - 1.0) * ATOMIC_MASS_UNIT_MEV
}

/// Largest kinetic energy (keV) a projectile of `energy_mev_u` hands to a
/// free electron in one collision.
#[must_use]
pub fn max_electron_energy_kev(energy_mev_u: f64) -> f64 {
    let gamma = lorentz_gamma_from_energy(energy_mev_u);
    let beta_gamma_sq = gamma * gamma - 1.0;
    let numerator = 2.0 * ELECTRON_MASS_MEV * beta_gamma_sq;
    let denominator = 1.0 + 2.0 * gamma * ELECTRON_MASS_U + ELECTRON_MASS_U * ELECTRON_MASS_U;
    1_000.0 * numerator / denominator
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElectronRangeModel {
    ButtsKatz,
    Waligorski,
    Geiss,
    Scholz,
    Edmund,
    Tabata,
    ScholzNew,
}

impl ElectronRangeModel {
    #[must_use]
    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            2 => Some(Self::ButtsKatz),
            3 => Some(Self::Waligorski),
            4 => Some(Self::Geiss),
            5 => Some(Self::Scholz),
            6 => Some(Self::Edmund),
            7 => Some(Self::Tabata),
            8 => Some(Self::ScholzNew),
            _ => None,
        }
    }

    #[must_use]
    pub const fn id(self) -> i64 {
        match self {
            Self::ButtsKatz => 2,
            Self::Waligorski => 3,
            Self::Geiss => 4,
            Self::Scholz => 5,
            Self::Edmund => 6,
            Self::Tabata => 7,
            Self::ScholzNew => 8,
        }
    }

    /// Range in g/cm^2.
    fn areal_range(self, energy_mev_u: f64, w_kev: f64, target: &TargetParams) -> f64 {
        match self {
            Self::ButtsKatz => 1.0e-5 * w_kev,
            Self::Waligorski => {
                let alpha = if w_kev < 1.0 { 1.079 } else { 1.667 };
                6.0e-6 * w_kev.powf(alpha)
            }
            Self::Geiss => 4.0e-5 * energy_mev_u.powf(1.5),
            Self::Scholz => 5.0e-6 * w_kev.powf(1.7),
            Self::Edmund => 6.13e-6 * w_kev.powf(1.66),
            Self::Tabata => tabata_range(w_kev / 1_000.0, target),
            Self::ScholzNew => 6.0e-6 * w_kev.powf(1.64),
        }
    }
}

// Tabata-Ito-Okabe fit coefficients.
const TABATA_B: [f64; 9] = [
    0.2335, 1.209, 1.78e-4, 0.9891, 3.01e-4, 1.468, 1.18e-2, 1.232, 0.109,
];

fn tabata_range(w_mev: f64, target: &TargetParams) -> f64 {
    let [b1, b2, b3, b4, b5, b6, b7, b8, b9] = TABATA_B;
    let z = target.average_z;
    let a1 = b1 * target.average_a / z.powf(b2);
    let a2 = b3 * z;
    let a3 = b4 - b5 * z;
    let a4 = b6 - b7 * z;
    let a5 = b8 / z.powf(b9);
    let tau = w_mev / ELECTRON_MASS_MEV;
    a1 * ((1.0 + a2 * tau).ln() / a2 - a3 * tau / (1.0 + a4 * tau.powf(a5)))
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct TargetParams {
    density_g_cm3: f64,
    average_a: f64,
    average_z: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BetaFromEnergyKernel;

impl ScalarKernel for BetaFromEnergyKernel {
    fn name(&self) -> &'static str {
        "beta_from_energy"
    }

    fn arity(&self) -> usize {
        1
    }

    fn evaluate(&self, inputs: &[KernelInput]) -> f64 {
        match inputs {
            [KernelInput::Number(energy)] => beta_from_energy(*energy),
            _ => f64::NAN,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnergyFromBetaKernel;

impl ScalarKernel for EnergyFromBetaKernel {
    fn name(&self) -> &'static str {
        "energy_from_beta"
    }

    fn arity(&self) -> usize {
        1
    }

    fn evaluate(&self, inputs: &[KernelInput]) -> f64 {
        match inputs {
            [KernelInput::Number(beta)] => energy_from_beta(*beta),
            _ => f64::NAN,
        }
    }
}

/// Electron range in meters for `[energy MeV/u, material id, model id]`.
#[derive(Debug, Clone)]
pub struct ElectronRangeKernel {
    targets: BTreeMap<i64, TargetParams>,
}

impl ElectronRangeKernel {
    #[must_use]
    pub fn from_registry(registry: &Registry) -> Self {
        let targets = registry
            .all_ids(Domain::Materials)
            .into_iter()
            .filter_map(|id| {
                let material = registry.material(id).ok()?;
                Some((
                    id,
                    TargetParams {
                        density_g_cm3: material.density_g_cm3,
                        average_a: material.average_a,
                        average_z: material.average_z,
                    },
                ))
            })
            .collect();
        Self { targets }
    }

    #[must_use]
    pub fn range_m(&self, energy_mev_u: f64, material_id: i64, model_id: i64) -> f64 {
        let (Some(target), Some(model)) = (
            self.targets.get(&material_id),
            ElectronRangeModel::from_id(model_id),
        ) else {
            return f64::NAN;
        };
        if energy_mev_u.is_nan() || energy_mev_u < 0.0 {
            return f64::NAN;
        }
        if energy_mev_u == 0.0 {
            return 0.0;
        }
        let w_kev = max_electron_energy_kev(energy_mev_u);
        let areal = model.areal_range(energy_mev_u, w_kev, target);
        areal / target.density_g_cm3 * 1.0e-2
    }
}

impl ScalarKernel for ElectronRangeKernel {
    fn name(&self) -> &'static str {
        "electron_range"
    }

    fn arity(&self) -> usize {
        3
    }

    fn evaluate(&self, inputs: &[KernelInput]) -> f64 {
        match inputs {
            [
                KernelInput::Number(energy),
                KernelInput::Id(material),
                KernelInput::Id(model),
            ] => self.range_m(*energy, *material, *model),
            _ => f64::NAN,
        }
    }
}
