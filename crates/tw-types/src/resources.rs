//! Resource quantities, resource sets and bundle specifications.
//!
//! Quantities are fixed-point so that packing fractional accelerators
//! (e.g. four trials at 0.25 GPU each) sums exactly to whole units.

use derive_more::{Add, AddAssign, Sub, SubAssign, Sum};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::errors::{ResourceError, TwResult};

pub const CPU: &str = "CPU";
pub const GPU: &str = "GPU";
pub const MEMORY: &str = "memory";

pub const FRACTIONS_PER_UNIT: u64 = 10_000;

/// Largest quantity, in whole units, a single resource entry may carry.
pub const MAX_RESOURCE_UNITS: f64 = 1e9;

/// A non-negative resource quantity with 1/10000 precision.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Hash,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Add,
    AddAssign,
    Sub,
    SubAssign,
    Sum,
)]
pub struct ResourceAmount(u64);

impl ResourceAmount {
    pub const ZERO: ResourceAmount = ResourceAmount(0);

    /// `fractions` of a whole unit or more carry over into the units.
    pub fn new(units: u32, fractions: u32) -> Self {
        ResourceAmount(units as u64 * FRACTIONS_PER_UNIT + fractions as u64)
    }

    pub fn new_units(units: u32) -> Self {
        ResourceAmount(units as u64 * FRACTIONS_PER_UNIT)
    }

    /// Convert a user-facing quantity, rounding to the nearest fraction.
    pub fn from_f64(value: f64) -> TwResult<Self> {
        if !value.is_finite() || value < 0.0 {
            return Err(ResourceError::InvalidRequest {
                message: format!("resource quantity must be a non-negative number, got {value}"),
            }
            .into());
        }
        if value > MAX_RESOURCE_UNITS {
            return Err(ResourceError::InvalidRequest {
                message: format!("resource quantity {value} exceeds the maximum of {MAX_RESOURCE_UNITS}"),
            }
            .into());
        }
        Ok(ResourceAmount((value * FRACTIONS_PER_UNIT as f64).round() as u64))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn units(&self) -> u64 {
        self.0 / FRACTIONS_PER_UNIT
    }

    pub fn fractions(&self) -> u64 {
        self.0 % FRACTIONS_PER_UNIT
    }

    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / FRACTIONS_PER_UNIT as f64
    }

    pub fn saturating_sub(self, other: ResourceAmount) -> ResourceAmount {
        ResourceAmount(self.0.saturating_sub(other.0))
    }

    pub fn saturating_add(self, other: ResourceAmount) -> ResourceAmount {
        ResourceAmount(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for ResourceAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.units())?;
        let fractions = self.fractions();
        if fractions != 0 {
            let digits = format!("{:04}", fractions);
            write!(f, ".{}", digits.trim_end_matches('0'))?;
        }
        Ok(())
    }
}

impl Serialize for ResourceAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for ResourceAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        ResourceAmount::from_f64(value).map_err(serde::de::Error::custom)
    }
}

/// Canonical spelling of well-known resource names (`cpu` -> `CPU`).
pub fn normalize_resource_name(name: &str) -> String {
    match name {
        "cpu" | "CPU" | "num_cpus" => CPU.to_string(),
        "gpu" | "GPU" | "num_gpus" => GPU.to_string(),
        other => other.to_string(),
    }
}

/// Mapping from resource name to quantity. Zero entries are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceSet(BTreeMap<String, ResourceAmount>);

impl ResourceSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Build a set from user-facing `(name, quantity)` pairs.
    pub fn from_f64_pairs<I, K>(pairs: I) -> TwResult<Self>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: AsRef<str>,
    {
        let mut set = ResourceSet::new();
        for (name, value) in pairs {
            let amount = ResourceAmount::from_f64(value)?;
            set.insert(normalize_resource_name(name.as_ref()), amount);
        }
        Ok(set)
    }

    pub fn insert(&mut self, name: impl Into<String>, amount: ResourceAmount) {
        let name = name.into();
        if amount.is_zero() {
            self.0.remove(&name);
        } else {
            self.0.insert(name, amount);
        }
    }

    pub fn get(&self, name: &str) -> ResourceAmount {
        self.0.get(name).copied().unwrap_or(ResourceAmount::ZERO)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ResourceAmount)> {
        self.0.iter().map(|(name, amount)| (name.as_str(), *amount))
    }

    /// Component-wise addition, saturating at the largest representable amount.
    pub fn add(&mut self, other: &ResourceSet) {
        for (name, amount) in other.iter() {
            let total = self.get(name).saturating_add(amount);
            self.insert(name, total);
        }
    }

    /// Component-wise subtraction, clamped at zero.
    pub fn subtract(&mut self, other: &ResourceSet) {
        for (name, amount) in other.iter() {
            let rest = self.get(name).saturating_sub(amount);
            self.insert(name, rest);
        }
    }

    /// True when every quantity in `other` fits into this set.
    pub fn contains(&self, other: &ResourceSet) -> bool {
        self.shortfall(other).is_none()
    }

    /// First resource (by name) that `other` needs more of than this set holds,
    /// as `(name, needed, available)`.
    pub fn shortfall(&self, other: &ResourceSet) -> Option<(String, ResourceAmount, ResourceAmount)> {
        other.iter().find_map(|(name, needed)| {
            let available = self.get(name);
            (needed > available).then(|| (name.to_string(), needed, available))
        })
    }

    pub fn sum<'a>(sets: impl IntoIterator<Item = &'a ResourceSet>) -> ResourceSet {
        let mut total = ResourceSet::new();
        for set in sets {
            total.add(set);
        }
        total
    }

    pub fn to_f64_map(&self) -> HashMap<String, f64> {
        self.iter()
            .map(|(name, amount)| (name.to_string(), amount.as_f64()))
            .collect()
    }
}

impl fmt::Display for ResourceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, amount)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}: {amount}")?;
        }
        write!(f, "}}")
    }
}

/// Reusable, immutable description of the bundles a trial needs.
///
/// Equality is structural, so one factory can be shared by many trials and
/// compared against a proposed replacement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<ResourceSet>", into = "Vec<ResourceSet>")]
pub struct PlacementGroupFactory {
    bundles: Vec<ResourceSet>,
}

impl PlacementGroupFactory {
    pub fn new(bundles: Vec<ResourceSet>) -> TwResult<Self> {
        if bundles.is_empty() {
            return Err(ResourceError::InvalidRequest {
                message: "a resource request needs at least one bundle".to_string(),
            }
            .into());
        }
        Ok(Self { bundles })
    }

    pub fn single(bundle: ResourceSet) -> Self {
        Self {
            bundles: vec![bundle],
        }
    }

    /// Shorthand for `[{name: quantity, ...}, ...]` bundle lists.
    pub fn from_bundles<B, K>(bundles: impl IntoIterator<Item = B>) -> TwResult<Self>
    where
        B: IntoIterator<Item = (K, f64)>,
        K: AsRef<str>,
    {
        let bundles = bundles
            .into_iter()
            .map(ResourceSet::from_f64_pairs)
            .collect::<TwResult<Vec<_>>>()?;
        Self::new(bundles)
    }

    pub fn bundles(&self) -> &[ResourceSet] {
        &self.bundles
    }

    pub fn head_bundle(&self) -> &ResourceSet {
        &self.bundles[0]
    }

    /// Total resources over all bundles.
    pub fn required_resources(&self) -> ResourceSet {
        ResourceSet::sum(&self.bundles)
    }
}

impl TryFrom<Vec<ResourceSet>> for PlacementGroupFactory {
    type Error = crate::TwError;

    fn try_from(bundles: Vec<ResourceSet>) -> Result<Self, Self::Error> {
        Self::new(bundles)
    }
}

impl From<PlacementGroupFactory> for Vec<ResourceSet> {
    fn from(factory: PlacementGroupFactory) -> Self {
        factory.bundles
    }
}

impl fmt::Display for PlacementGroupFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, bundle) in self.bundles.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{bundle}")?;
        }
        write!(f, "]")
    }
}

fn default_cpu() -> f64 {
    1.0
}

/// Flat per-trial resource shorthand (`{"cpu": 2, "gpu": 0.5}`).
///
/// The `extra_*` quantities are placed in a second bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlatResources {
    #[serde(default = "default_cpu")]
    pub cpu: f64,
    #[serde(default)]
    pub gpu: f64,
    #[serde(default)]
    pub memory: f64,
    #[serde(default)]
    pub custom_resources: HashMap<String, f64>,
    #[serde(default)]
    pub extra_cpu: f64,
    #[serde(default)]
    pub extra_gpu: f64,
    #[serde(default)]
    pub extra_custom_resources: HashMap<String, f64>,
}

impl Default for FlatResources {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            gpu: 0.0,
            memory: 0.0,
            custom_resources: HashMap::new(),
            extra_cpu: 0.0,
            extra_gpu: 0.0,
            extra_custom_resources: HashMap::new(),
        }
    }
}

/// User-facing resource request: flat shorthand or explicit bundle list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceSpec {
    Bundles(Vec<HashMap<String, f64>>),
    Flat(FlatResources),
}

impl ResourceSpec {
    pub fn cpu_gpu(cpu: f64, gpu: f64) -> Self {
        ResourceSpec::Flat(FlatResources {
            cpu,
            gpu,
            ..FlatResources::default()
        })
    }

    /// Normalize into the internal bundle sequence.
    pub fn to_placement_group_factory(&self) -> TwResult<PlacementGroupFactory> {
        match self {
            ResourceSpec::Bundles(bundles) => PlacementGroupFactory::from_bundles(
                bundles
                    .iter()
                    .map(|bundle| bundle.iter().map(|(name, value)| (name.as_str(), *value))),
            ),
            ResourceSpec::Flat(flat) => {
                let mut head = ResourceSet::from_f64_pairs([
                    (CPU, flat.cpu),
                    (GPU, flat.gpu),
                    (MEMORY, flat.memory),
                ])?;
                head.add(&ResourceSet::from_f64_pairs(
                    flat.custom_resources.iter().map(|(k, v)| (k.as_str(), *v)),
                )?);

                let mut extra = ResourceSet::from_f64_pairs([
                    (CPU, flat.extra_cpu),
                    (GPU, flat.extra_gpu),
                ])?;
                extra.add(&ResourceSet::from_f64_pairs(
                    flat.extra_custom_resources
                        .iter()
                        .map(|(k, v)| (k.as_str(), *v)),
                )?);

                let mut bundles = vec![head];
                if !extra.is_empty() {
                    bundles.push(extra);
                }
                PlacementGroupFactory::new(bundles)
            }
        }
    }
}

impl TryFrom<&ResourceSpec> for PlacementGroupFactory {
    type Error = crate::TwError;

    fn try_from(spec: &ResourceSpec) -> Result<Self, Self::Error> {
        spec.to_placement_group_factory()
    }
}
