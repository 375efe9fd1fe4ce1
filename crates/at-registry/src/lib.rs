#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Domain {
    Materials,
    Particles,
    Models,
}

impl Domain {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Materials => "material",
            Self::Particles => "particle",
            Self::Models => "model",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Condensed,
    Gaseous,
}

/// Material record. `short_name` is derived from `long_name` when the
/// registry is built.
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub id: i64,
    pub short_name: String,
    pub long_name: String,
    pub density_g_cm3: f64,
    pub i_ev: f64,
    pub alpha_g_cm2_mev: f64,
    pub p_mev: f64,
    pub m_g_cm2: f64,
    pub average_a: f64,
    pub average_z: f64,
    pub phase: Phase,
}

/// Particle record. Registry rows never carry a mass number; `a` is only
/// set on particles produced by isotope lookups (`"12C"`, `6012`).
#[derive(Debug, Clone, PartialEq)]
pub struct Particle {
    pub id: i64,
    pub z: u32,
    pub a: Option<u32>,
    pub element_name: String,
    pub element_acronym: String,
    pub atomic_weight: f64,
    pub density_g_cm3: f64,
    pub i_ev_per_z: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Model {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEntry {
    Material(Material),
    Particle(Particle),
    Model(Model),
}

impl RegistryEntry {
    #[must_use]
    pub fn domain(&self) -> Domain {
        match self {
            Self::Material(_) => Domain::Materials,
            Self::Particle(_) => Domain::Particles,
            Self::Model(_) => Domain::Models,
        }
    }

    #[must_use]
    pub fn id(&self) -> i64 {
        match self {
            Self::Material(material) => material.id,
            Self::Particle(particle) => particle.id,
            Self::Model(model) => model.id,
        }
    }

    /// Name that round-trips through `resolve_by_name` and appears in
    /// `all_names`.
    #[must_use]
    pub fn canonical_name(&self) -> &str {
        match self {
            Self::Material(material) => material.short_name.as_str(),
            Self::Particle(particle) => particle.element_acronym.as_str(),
            Self::Model(model) => model.name.as_str(),
        }
    }
}

/// A caller-supplied reference to a registry entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    Id(i64),
    Name(String),
    Entry(RegistryEntry),
    Unsupported { type_name: String },
}

impl Selector {
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::Id(_) => "int",
            Self::Name(_) => "str",
            Self::Entry(entry) => entry.domain().label(),
            Self::Unsupported { type_name } => type_name.as_str(),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Name(name) => write!(f, "'{name}'"),
            Self::Entry(entry) => write!(f, "{}({})", entry.domain().label(), entry.id()),
            Self::Unsupported { type_name } => write!(f, "<{type_name}>"),
        }
    }
}

impl From<i64> for Selector {
    fn from(value: i64) -> Self {
        Self::Id(value)
    }
}

impl From<&str> for Selector {
    fn from(value: &str) -> Self {
        Self::Name(value.to_string())
    }
}

impl From<String> for Selector {
    fn from(value: String) -> Self {
        Self::Name(value)
    }
}

impl From<RegistryEntry> for Selector {
    fn from(value: RegistryEntry) -> Self {
        Self::Entry(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    UnknownIdentifier { domain: Domain, identifier: String },
    InvalidSelectorType { domain: Domain, type_name: String },
    DuplicateId { domain: Domain, id: i64 },
    DuplicateName { domain: Domain, name: String },
    AlreadyInitialized,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownIdentifier { domain, identifier } => {
                write!(f, "unknown {} identifier: {identifier}", domain.label())
            }
            Self::InvalidSelectorType { domain, type_name } => write!(
                f,
                "{} selector must be an id, a name or a {} descriptor, got {type_name}",
                domain.label(),
                domain.label()
            ),
            Self::DuplicateId { domain, id } => {
                write!(f, "duplicate {} id {id}", domain.label())
            }
            Self::DuplicateName { domain, name } => {
                write!(f, "duplicate {} name '{name}'", domain.label())
            }
            Self::AlreadyInitialized => write!(f, "registry is already initialized"),
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Debug, Clone)]
struct Table<T> {
    domain: Domain,
    rows: Vec<T>,
    by_id: BTreeMap<i64, usize>,
    by_name: BTreeMap<String, usize>,
}

impl<T> Table<T> {
    fn build<F>(domain: Domain, rows: Vec<T>, keys: F) -> Result<Self, RegistryError>
    where
        F: Fn(&T) -> (i64, Vec<&str>),
    {
        let mut by_id = BTreeMap::new();
        let mut by_name = BTreeMap::new();
        for (row_index, row) in rows.iter().enumerate() {
            let (id, names) = keys(row);
            if by_id.insert(id, row_index).is_some() {
                return Err(RegistryError::DuplicateId { domain, id });
            }
            for name in names {
                if by_name.insert(name.to_string(), row_index).is_some() {
                    return Err(RegistryError::DuplicateName {
                        domain,
                        name: name.to_string(),
                    });
                }
            }
        }
        Ok(Self {
            domain,
            rows,
            by_id,
            by_name,
        })
    }

    fn by_id(&self, id: i64) -> Result<&T, RegistryError> {
        self.by_id
            .get(&id)
            .map(|&row_index| &self.rows[row_index])
            .ok_or_else(|| RegistryError::UnknownIdentifier {
                domain: self.domain,
                identifier: id.to_string(),
            })
    }

    fn by_name(&self, name: &str) -> Option<&T> {
        self.by_name.get(name).map(|&row_index| &self.rows[row_index])
    }

    fn unknown_name(&self, name: &str) -> RegistryError {
        RegistryError::UnknownIdentifier {
            domain: self.domain,
            identifier: format!("'{name}'"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    materials: Table<Material>,
    particles: Table<Particle>,
    models: Table<Model>,
}

impl Registry {
    /// Builds a registry from ordered records, rejecting duplicate ids or
    /// names within a domain.
    pub fn from_records(
        materials: Vec<Material>,
        particles: Vec<Particle>,
        models: Vec<Model>,
    ) -> Result<Self, RegistryError> {
        Ok(Self {
            materials: Table::build(Domain::Materials, materials, |material| {
                (
                    material.id,
                    dedup_names(&[material.short_name.as_str(), material.long_name.as_str()]),
                )
            })?,
            particles: Table::build(Domain::Particles, particles, |particle| {
                (
                    particle.id,
                    dedup_names(&[
                        particle.element_acronym.as_str(),
                        particle.element_name.as_str(),
                    ]),
                )
            })?,
            models: Table::build(Domain::Models, models, |model| {
                (model.id, vec![model.name.as_str()])
            })?,
        })
    }

    pub fn builtin() -> Result<Self, RegistryError> {
        Self::from_records(
            builtin_materials(),
            builtin_particles(),
            builtin_models(),
        )
    }

    pub fn resolve_by_id(&self, domain: Domain, id: i64) -> Result<RegistryEntry, RegistryError> {
        match domain {
            Domain::Materials => self.materials.by_id(id).cloned().map(RegistryEntry::Material),
            Domain::Particles => self.particles.by_id(id).cloned().map(RegistryEntry::Particle),
            Domain::Models => self.models.by_id(id).cloned().map(RegistryEntry::Model),
        }
    }

    pub fn resolve_by_name(
        &self,
        domain: Domain,
        name: &str,
    ) -> Result<RegistryEntry, RegistryError> {
        match domain {
            Domain::Materials => self
                .materials
                .by_name(name)
                .cloned()
                .map(RegistryEntry::Material)
                .ok_or_else(|| self.materials.unknown_name(name)),
            Domain::Particles => self.particle_from_string(name).map(RegistryEntry::Particle),
            Domain::Models => self
                .models
                .by_name(name)
                .cloned()
                .map(RegistryEntry::Model)
                .ok_or_else(|| self.models.unknown_name(name)),
        }
    }

    pub fn resolve(
        &self,
        domain: Domain,
        selector: &Selector,
    ) -> Result<RegistryEntry, RegistryError> {
        match selector {
            Selector::Id(id) => self.resolve_by_id(domain, *id),
            Selector::Name(name) => self.resolve_by_name(domain, name),
            Selector::Entry(entry) if entry.domain() == domain => Ok(entry.clone()),
            Selector::Entry(_) | Selector::Unsupported { .. } => {
                Err(RegistryError::InvalidSelectorType {
                    domain,
                    type_name: selector.type_name().to_string(),
                })
            }
        }
    }

    /// Resolves straight to the numeric id handed to kernels.
    pub fn resolve_id(&self, domain: Domain, selector: &Selector) -> Result<i64, RegistryError> {
        match selector {
            Selector::Id(id) => self.resolve_by_id(domain, *id).map(|_| *id),
            _ => self.resolve(domain, selector).map(|entry| entry.id()),
        }
    }

    #[must_use]
    pub fn all_ids(&self, domain: Domain) -> Vec<i64> {
        match domain {
            Domain::Materials => self.materials.rows.iter().map(|row| row.id).collect(),
            Domain::Particles => self.particles.rows.iter().map(|row| row.id).collect(),
            Domain::Models => self.models.rows.iter().map(|row| row.id).collect(),
        }
    }

    #[must_use]
    pub fn all_names(&self, domain: Domain) -> Vec<String> {
        match domain {
            Domain::Materials => self
                .materials
                .rows
                .iter()
                .map(|row| row.short_name.clone())
                .collect(),
            Domain::Particles => self
                .particles
                .rows
                .iter()
                .map(|row| row.element_acronym.clone())
                .collect(),
            Domain::Models => self.models.rows.iter().map(|row| row.name.clone()).collect(),
        }
    }

    /// Descriptive names: material long names, particle element names,
    /// model names.
    #[must_use]
    pub fn all_long_names(&self, domain: Domain) -> Vec<String> {
        match domain {
            Domain::Materials => self
                .materials
                .rows
                .iter()
                .map(|row| row.long_name.clone())
                .collect(),
            Domain::Particles => self
                .particles
                .rows
                .iter()
                .map(|row| row.element_name.clone())
                .collect(),
            Domain::Models => self.all_names(Domain::Models),
        }
    }

    pub fn material(&self, id: i64) -> Result<&Material, RegistryError> {
        self.materials.by_id(id)
    }

    pub fn model(&self, id: i64) -> Result<&Model, RegistryError> {
        self.models.by_id(id)
    }

    pub fn particle(&self, id: i64) -> Result<&Particle, RegistryError> {
        self.particles.by_id(id)
    }

    /// Particle from `1000 * Z + A`.
    pub fn particle_from_number(&self, particle_no: i64) -> Result<Particle, RegistryError> {
        let unknown = || RegistryError::UnknownIdentifier {
            domain: Domain::Particles,
            identifier: format!("particle number {particle_no}"),
        };
        if particle_no < 1000 {
            return Err(unknown());
        }
        let z = particle_no / 1000;
        let a = particle_no % 1000;
        if a < z {
            return Err(unknown());
        }
        let row = self
            .particles
            .rows
            .iter()
            .find(|row| i64::from(row.z) == z)
            .ok_or_else(unknown)?;
        let mut particle = row.clone();
        particle.a = u32::try_from(a).ok();
        Ok(particle)
    }

    /// Particle from an acronym (`"He"`), an element name (`"Helium"`) or an
    /// isotope notation with a leading mass number (`"4He"`).
    pub fn particle_from_string(&self, name: &str) -> Result<Particle, RegistryError> {
        if let Some(particle) = self.particles.by_name(name) {
            return Ok(particle.clone());
        }

        let split = name
            .find(|ch: char| !ch.is_ascii_digit())
            .unwrap_or(name.len());
        let (digits, acronym) = name.split_at(split);
        if digits.is_empty() || acronym.is_empty() {
            return Err(self.particles.unknown_name(name));
        }
        let mass_number = digits
            .parse::<u32>()
            .map_err(|_| self.particles.unknown_name(name))?;
        let mut particle = self
            .particles
            .by_name(acronym)
            .filter(|row| row.element_acronym == acronym)
            .cloned()
            .ok_or_else(|| self.particles.unknown_name(name))?;
        particle.a = Some(mass_number);
        Ok(particle)
    }
}

static REGISTRY: OnceLock<Result<Registry, RegistryError>> = OnceLock::new();

/// Process-wide registry. Built from the builtin tables on first access
/// unless [`install`] ran earlier.
pub fn registry() -> Result<&'static Registry, RegistryError> {
    REGISTRY
        .get_or_init(Registry::builtin)
        .as_ref()
        .map_err(Clone::clone)
}

/// Installs caller-supplied tables. Only the first initialization wins.
pub fn install(registry: Registry) -> Result<(), RegistryError> {
    REGISTRY
        .set(Ok(registry))
        .map_err(|_| RegistryError::AlreadyInitialized)
}

/// Lowercase, spaces to underscores, everything else non-alphanumeric
/// dropped: `"Water, Liquid"` becomes `"water_liquid"`.
#[must_use]
pub fn sanitize_name(long_name: &str) -> String {
    long_name
        .chars()
        .map(|ch| if ch == ' ' { '_' } else { ch })
        .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .map(|ch| ch.to_ascii_lowercase())
        .collect()
}

fn dedup_names<'a>(names: &[&'a str]) -> Vec<&'a str> {
    let mut out: Vec<&str> = Vec::with_capacity(names.len());
    for name in names {
        if !out.contains(name) {
            out.push(name);
        }
    }
    out
}

// id, long name, density, I, alpha, p, m, <A>, <Z>, phase
type MaterialRow = (
    i64,
    &'static str,
    f64,
    f64,
    f64,
    f64,
    f64,
    f64,
    f64,
    Phase,
);

const MATERIAL_ROWS: [MaterialRow; 14] = [
    (1, "Water, Liquid", 1.0, 75.0, 0.002_31, 1.761, 0.011_53, 6.0, 3.333, Phase::Condensed),
    (2, "Aluminum Oxide", 3.97, 145.2, 0.002_68, 1.742, 0.008_84, 20.39, 10.0, Phase::Condensed),
    (3, "Aluminum", 2.698_9, 166.0, 0.002_78, 1.738, 0.008_58, 26.98, 13.0, Phase::Condensed),
    (4, "PMMA", 1.19, 74.0, 0.002_26, 1.763, 0.011_01, 6.674, 3.6, Phase::Condensed),
    (5, "Alanine", 1.42, 71.9, 0.002_27, 1.762, 0.010_95, 6.846, 3.692, Phase::Condensed),
    (6, "LiF", 2.635, 94.0, 0.002_46, 1.755, 0.009_72, 12.97, 6.0, Phase::Condensed),
    (7, "Air", 0.001_204_79, 85.7, 0.002_55, 1.751, 0.010_15, 14.5, 7.26, Phase::Gaseous),
    (8, "Silicon", 2.33, 173.0, 0.002_81, 1.737, 0.008_42, 28.09, 14.0, Phase::Condensed),
    (9, "Copper", 8.96, 322.0, 0.003_12, 1.722, 0.007_21, 63.55, 29.0, Phase::Condensed),
    (10, "Gold", 19.32, 790.0, 0.003_96, 1.689, 0.005_02, 196.97, 79.0, Phase::Condensed),
    (11, "Lead", 11.35, 823.0, 0.004_01, 1.687, 0.004_96, 207.2, 82.0, Phase::Condensed),
    (12, "Polyethylene", 0.94, 57.4, 0.002_12, 1.768, 0.012_03, 4.667, 2.667, Phase::Condensed),
    (13, "Mylar", 1.4, 78.7, 0.002_29, 1.760, 0.010_78, 8.727, 4.545, Phase::Condensed),
    (14, "Tungsten", 19.3, 727.0, 0.003_91, 1.691, 0.005_11, 183.84, 74.0, Phase::Condensed),
];

// name, acronym, atomic weight, density, I per Z
const PARTICLE_ROWS: [(&str, &str, f64, f64, f64); 30] = [
    ("Hydrogen", "H", 1.008, 0.000_089_9, 19.2),
    ("Helium", "He", 4.002_6, 0.000_178_5, 20.9),
    ("Lithium", "Li", 6.94, 0.534, 13.33),
    ("Beryllium", "Be", 9.012_2, 1.848, 15.93),
    ("Boron", "B", 10.81, 2.34, 15.2),
    ("Carbon", "C", 12.011, 2.0, 13.0),
    ("Nitrogen", "N", 14.007, 0.001_250_6, 11.71),
    ("Oxygen", "O", 15.999, 0.001_429, 11.88),
    ("Fluorine", "F", 18.998, 0.001_696, 12.78),
    ("Neon", "Ne", 20.180, 0.000_9, 13.7),
    ("Sodium", "Na", 22.990, 0.971, 13.55),
    ("Magnesium", "Mg", 24.305, 1.738, 13.0),
    ("Aluminium", "Al", 26.982, 2.698, 12.77),
    ("Silicon", "Si", 28.085, 2.33, 12.36),
    ("Phosphorus", "P", 30.974, 1.82, 11.53),
    ("Sulfur", "S", 32.06, 2.07, 11.25),
    ("Chlorine", "Cl", 35.45, 0.003_214, 10.24),
    ("Argon", "Ar", 39.948, 0.001_784, 10.44),
    ("Potassium", "K", 39.098, 0.862, 10.0),
    ("Calcium", "Ca", 40.078, 1.55, 9.55),
    ("Scandium", "Sc", 44.956, 2.985, 10.29),
    ("Titanium", "Ti", 47.867, 4.507, 10.59),
    ("Vanadium", "V", 50.942, 6.11, 10.65),
    ("Chromium", "Cr", 51.996, 7.19, 10.71),
    ("Manganese", "Mn", 54.938, 7.21, 10.88),
    ("Iron", "Fe", 55.845, 7.874, 11.0),
    ("Cobalt", "Co", 58.933, 8.9, 11.0),
    ("Nickel", "Ni", 58.693, 8.908, 11.11),
    ("Copper", "Cu", 63.546, 8.96, 11.1),
    ("Zinc", "Zn", 65.38, 7.14, 11.0),
];

const MODEL_ROWS: [(i64, &str); 7] = [
    (2, "butts_katz"),
    (3, "waligorski"),
    (4, "geiss"),
    (5, "scholz"),
    (6, "edmund"),
    (7, "tabata"),
    (8, "scholz_new"),
];

#[must_use]
pub fn builtin_materials() -> Vec<Material> {
    MATERIAL_ROWS
        .iter()
        .map(
            |&(id, long_name, density_g_cm3, i_ev, alpha_g_cm2_mev, p_mev, m_g_cm2, average_a, average_z, phase)| {
                Material {
                    id,
                    short_name: sanitize_name(long_name),
                    long_name: long_name.to_string(),
                    density_g_cm3,
                    i_ev,
                    alpha_g_cm2_mev,
                    p_mev,
                    m_g_cm2,
                    average_a,
                    average_z,
                    phase,
                }
            },
        )
        .collect()
}

#[must_use]
pub fn builtin_particles() -> Vec<Particle> {
    PARTICLE_ROWS
        .iter()
        .zip(1u32..)
        .map(
            |(&(element_name, element_acronym, atomic_weight, density_g_cm3, i_ev_per_z), z)| {
                Particle {
                    id: i64::from(z),
                    z,
                    a: None,
                    element_name: element_name.to_string(),
                    element_acronym: element_acronym.to_string(),
                    atomic_weight,
                    density_g_cm3,
                    i_ev_per_z,
                }
            },
        )
        .collect()
}

#[must_use]
pub fn builtin_models() -> Vec<Model> {
    MODEL_ROWS
        .iter()
        .map(|&(id, name)| Model {
            id,
            name: name.to_string(),
        })
        .collect()
}
