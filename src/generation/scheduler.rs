// Scheduler catalog - maps sampler and scheduler-variant names to a
// numerical integration algorithm plus config overrides

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const ALGORITHM_TYPE: &str = "algorithm_type";
pub const SOLVER_ORDER: &str = "solver_order";
pub const USE_KARRAS_SIGMAS: &str = "use_karras_sigmas";
pub const TIMESTEP_SPACING: &str = "timestep_spacing";
pub const BETA_SCHEDULE: &str = "beta_schedule";

/// `algorithm_type` value for standard multistep DPM-Solver++
pub const DPMSOLVER_PLUS_PLUS: &str = "dpmsolver++";
/// `algorithm_type` value for the SDE variant of DPM-Solver++
pub const SDE_DPMSOLVER_PLUS_PLUS: &str = "sde-dpmsolver++";

/// Numerical integration algorithm families
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SchedulerAlgorithm {
    EulerDiscrete,
    EulerAncestralDiscrete,
    DpmSolverMultistep,
    DpmSolverSinglestep,
    Ddim,
    Pndm,
}

const COMMON_KEYS: &[&str] = &[
    "num_train_timesteps",
    "beta_start",
    "beta_end",
    BETA_SCHEDULE,
    "trained_betas",
    "prediction_type",
    TIMESTEP_SPACING,
    "steps_offset",
];

impl SchedulerAlgorithm {
    /// Used whenever a sampler name is not in the catalog
    pub const DEFAULT: SchedulerAlgorithm = SchedulerAlgorithm::EulerDiscrete;

    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerAlgorithm::EulerDiscrete => "EulerDiscrete",
            SchedulerAlgorithm::EulerAncestralDiscrete => "EulerAncestralDiscrete",
            SchedulerAlgorithm::DpmSolverMultistep => "DPMSolverMultistep",
            SchedulerAlgorithm::DpmSolverSinglestep => "DPMSolverSinglestep",
            SchedulerAlgorithm::Ddim => "DDIM",
            SchedulerAlgorithm::Pndm => "PNDM",
        }
    }

    fn specific_keys(&self) -> &'static [&'static str] {
        match self {
            SchedulerAlgorithm::EulerDiscrete => &[
                "interpolation_type",
                USE_KARRAS_SIGMAS,
                "use_exponential_sigmas",
                "sigma_min",
                "sigma_max",
                "rescale_betas_zero_snr",
                "final_sigmas_type",
            ],
            SchedulerAlgorithm::EulerAncestralDiscrete => &["rescale_betas_zero_snr"],
            SchedulerAlgorithm::DpmSolverMultistep => &[
                SOLVER_ORDER,
                ALGORITHM_TYPE,
                "solver_type",
                "lower_order_final",
                "euler_at_final",
                USE_KARRAS_SIGMAS,
                "use_lu_lambdas",
                "thresholding",
                "dynamic_thresholding_ratio",
                "sample_max_value",
                "variance_type",
                "lambda_min_clipped",
                "final_sigmas_type",
            ],
            SchedulerAlgorithm::DpmSolverSinglestep => &[
                SOLVER_ORDER,
                ALGORITHM_TYPE,
                "solver_type",
                "lower_order_final",
                USE_KARRAS_SIGMAS,
                "thresholding",
                "dynamic_thresholding_ratio",
                "sample_max_value",
                "variance_type",
                "lambda_min_clipped",
                "final_sigmas_type",
            ],
            SchedulerAlgorithm::Ddim => &[
                "clip_sample",
                "clip_sample_range",
                "set_alpha_to_one",
                "thresholding",
                "dynamic_thresholding_ratio",
                "sample_max_value",
                "rescale_betas_zero_snr",
            ],
            SchedulerAlgorithm::Pndm => &["skip_prk_steps", "set_alpha_to_one"],
        }
    }

    /// Whether the algorithm's constructor takes this config key
    pub fn accepts(&self, key: &str) -> bool {
        COMMON_KEYS.contains(&key) || self.specific_keys().contains(&key)
    }
}

impl fmt::Display for SchedulerAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single scheduler config value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OverrideValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl OverrideValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OverrideValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            OverrideValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            OverrideValue::Float(f) => Some(*f),
            OverrideValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OverrideValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for OverrideValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverrideValue::Bool(b) => write!(f, "{}", b),
            OverrideValue::Int(i) => write!(f, "{}", i),
            OverrideValue::Float(x) => write!(f, "{}", x),
            OverrideValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for OverrideValue {
    fn from(value: bool) -> Self {
        OverrideValue::Bool(value)
    }
}

impl From<i64> for OverrideValue {
    fn from(value: i64) -> Self {
        OverrideValue::Int(value)
    }
}

impl From<f64> for OverrideValue {
    fn from(value: f64) -> Self {
        OverrideValue::Float(value)
    }
}

impl From<&str> for OverrideValue {
    fn from(value: &str) -> Self {
        OverrideValue::Text(value.to_string())
    }
}

impl From<String> for OverrideValue {
    fn from(value: String) -> Self {
        OverrideValue::Text(value)
    }
}

/// Scheduler configuration as key/value pairs
pub type SchedulerConfig = BTreeMap<String, OverrideValue>;

/// Recovered lookup or construction problems, kept for diagnostics
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogFallback {
    UnknownSampler {
        requested: String,
        fallback: SchedulerAlgorithm,
    },
    UnknownVariant {
        requested: String,
    },
    UnsupportedSchedulerOption {
        algorithm: SchedulerAlgorithm,
        rejected: Vec<String>,
        /// True when construction was retried with no overrides at all
        retried_with_defaults: bool,
    },
}

/// A resolved scheduler: algorithm plus its effective configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerSpec {
    pub algorithm: SchedulerAlgorithm,

    /// Base config fields (when one was supplied) with the overrides applied
    pub config: SchedulerConfig,

    #[serde(skip)]
    pub fallbacks: Vec<CatalogFallback>,
}

impl SchedulerSpec {
    pub fn get(&self, key: &str) -> Option<&OverrideValue> {
        self.config.get(key)
    }

    pub fn algorithm_type(&self) -> Option<&str> {
        self.get(ALGORITHM_TYPE).and_then(OverrideValue::as_str)
    }

    pub fn solver_order(&self) -> Option<i64> {
        self.get(SOLVER_ORDER).and_then(OverrideValue::as_i64)
    }

    pub fn use_karras_sigmas(&self) -> bool {
        self.get(USE_KARRAS_SIGMAS)
            .and_then(OverrideValue::as_bool)
            .unwrap_or(false)
    }

    pub fn timestep_spacing(&self) -> Option<&str> {
        self.get(TIMESTEP_SPACING).and_then(OverrideValue::as_str)
    }

    pub fn beta_schedule(&self) -> Option<&str> {
        self.get(BETA_SCHEDULE).and_then(OverrideValue::as_str)
    }

    /// True when no fallback of any kind was needed
    pub fn is_exact(&self) -> bool {
        self.fallbacks.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum Preset {
    Bool(bool),
    Text(&'static str),
}

impl From<Preset> for OverrideValue {
    fn from(preset: Preset) -> Self {
        match preset {
            Preset::Bool(b) => OverrideValue::Bool(b),
            Preset::Text(s) => OverrideValue::Text(s.to_string()),
        }
    }
}

type Presets = &'static [(&'static str, Preset)];

const KARRAS: Presets = &[(USE_KARRAS_SIGMAS, Preset::Bool(true))];

// Keys are normalized names. Sampler presets only carry sigma/spacing hints;
// the variant table wins for those keys.
const SAMPLERS: &[(&str, SchedulerAlgorithm, Presets)] = &[
    ("euler", SchedulerAlgorithm::EulerDiscrete, &[]),
    ("euler_a", SchedulerAlgorithm::EulerAncestralDiscrete, &[]),
    ("euler_ancestral", SchedulerAlgorithm::EulerAncestralDiscrete, &[]),
    ("dpmpp_2m", SchedulerAlgorithm::DpmSolverMultistep, &[]),
    ("dpmpp_2s_a", SchedulerAlgorithm::DpmSolverMultistep, KARRAS),
    ("dpmpp_sde", SchedulerAlgorithm::DpmSolverMultistep, &[]),
    ("dpmpp_2m_sde", SchedulerAlgorithm::DpmSolverMultistep, &[]),
    ("dpmpp_3m_sde", SchedulerAlgorithm::DpmSolverMultistep, &[]),
    ("dpmpp_sde_gpu", SchedulerAlgorithm::DpmSolverMultistep, &[]),
    ("dpmpp_2m_sde_gpu", SchedulerAlgorithm::DpmSolverMultistep, &[]),
    ("dpmpp_3m_sde_gpu", SchedulerAlgorithm::DpmSolverMultistep, &[]),
    ("ddim", SchedulerAlgorithm::Ddim, &[]),
    ("pndm", SchedulerAlgorithm::Pndm, &[]),
    // A1111-style names
    ("dpm++_2m", SchedulerAlgorithm::DpmSolverMultistep, &[]),
    ("dpm++_2m_karras", SchedulerAlgorithm::DpmSolverMultistep, KARRAS),
    ("dpm++_sde", SchedulerAlgorithm::DpmSolverMultistep, &[]),
    ("dpm++_sde_karras", SchedulerAlgorithm::DpmSolverMultistep, KARRAS),
    ("dpm++_2m_sde", SchedulerAlgorithm::DpmSolverMultistep, &[]),
    ("dpm++_2m_sde_karras", SchedulerAlgorithm::DpmSolverMultistep, KARRAS),
    ("dpm++_3m_sde", SchedulerAlgorithm::DpmSolverMultistep, &[]),
    ("dpm++_3m_sde_karras", SchedulerAlgorithm::DpmSolverMultistep, KARRAS),
    ("heun", SchedulerAlgorithm::EulerDiscrete, &[]),
    ("dpm2", SchedulerAlgorithm::DpmSolverSinglestep, &[]),
    ("dpm2_karras", SchedulerAlgorithm::DpmSolverSinglestep, KARRAS),
    ("dpm2_a", SchedulerAlgorithm::EulerAncestralDiscrete, &[]),
    ("dpm2_a_karras", SchedulerAlgorithm::EulerAncestralDiscrete, KARRAS),
    ("lms", SchedulerAlgorithm::Ddim, &[]),
    ("lms_karras", SchedulerAlgorithm::Ddim, KARRAS),
];

const VARIANTS: &[(&str, Presets)] = &[
    ("normal", &[]),
    ("karras", KARRAS),
    ("exponential", &[(BETA_SCHEDULE, Preset::Text("exponential"))]),
    ("sgm_uniform", &[(TIMESTEP_SPACING, Preset::Text("trailing"))]),
    ("simple", &[(TIMESTEP_SPACING, Preset::Text("leading"))]),
    ("ddim_uniform", &[(TIMESTEP_SPACING, Preset::Text("linspace"))]),
];

// Second-order multistep names that pin the standard algorithm type
const PLAIN_MULTISTEP: &[&str] = &["dpmpp_2m", "dpmpp_2s_a", "dpm++_2m", "dpm++_2m_karras"];

/// Lowercase, trim, and fold runs of whitespace, `-` and `_` into one `_`
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.trim().chars() {
        if c.is_whitespace() || c == '-' || c == '_' {
            pending_sep = true;
            continue;
        }
        if pending_sep && !out.is_empty() {
            out.push('_');
        }
        pending_sep = false;
        out.extend(c.to_lowercase());
    }
    out
}

/// Registry resolving sampler + variant names into a [`SchedulerSpec`]
#[derive(Debug, Clone)]
pub struct SchedulerCatalog {
    default_algorithm: SchedulerAlgorithm,
}

impl SchedulerCatalog {
    pub fn new() -> Self {
        Self {
            default_algorithm: SchedulerAlgorithm::DEFAULT,
        }
    }

    /// Use a different fallback for unknown sampler names
    pub fn with_default_algorithm(mut self, algorithm: SchedulerAlgorithm) -> Self {
        self.default_algorithm = algorithm;
        self
    }

    pub fn lookup_sampler(&self, name: &str) -> Option<SchedulerAlgorithm> {
        let key = normalize_name(name);
        SAMPLERS
            .iter()
            .find(|(k, _, _)| *k == key)
            .map(|(_, algorithm, _)| *algorithm)
    }

    pub fn is_known_sampler(&self, name: &str) -> bool {
        self.lookup_sampler(name).is_some()
    }

    pub fn is_known_variant(&self, name: &str) -> bool {
        let key = normalize_name(name);
        VARIANTS.iter().any(|(k, _)| *k == key)
    }

    pub fn sampler_names(&self) -> impl Iterator<Item = &'static str> {
        SAMPLERS.iter().map(|(name, _, _)| *name)
    }

    pub fn variant_names(&self) -> impl Iterator<Item = &'static str> {
        VARIANTS.iter().map(|(name, _)| *name)
    }

    /// Resolve a sampler and variant into an algorithm with overrides.
    ///
    /// Never fails: unknown samplers fall back to the default algorithm,
    /// unknown variants to no overrides, and rejected override keys to the
    /// algorithm's own defaults. Each fallback is logged and recorded on the
    /// returned spec.
    pub fn resolve(
        &self,
        sampler_name: &str,
        scheduler_variant: &str,
        base_config: Option<&SchedulerConfig>,
    ) -> SchedulerSpec {
        let sampler_key = normalize_name(sampler_name);
        let variant_key = normalize_name(scheduler_variant);
        let mut fallbacks = Vec::new();

        let (algorithm, sampler_presets) = match SAMPLERS.iter().find(|(k, _, _)| *k == sampler_key) {
            Some((_, algorithm, presets)) => (*algorithm, *presets),
            None => {
                tracing::warn!(
                    "Unknown sampler '{}', falling back to {}",
                    sampler_name,
                    self.default_algorithm
                );
                fallbacks.push(CatalogFallback::UnknownSampler {
                    requested: sampler_name.to_string(),
                    fallback: self.default_algorithm,
                });
                (self.default_algorithm, &[][..])
            }
        };

        let mut overrides = SchedulerConfig::new();
        match VARIANTS.iter().find(|(k, _)| *k == variant_key) {
            Some((_, presets)) => {
                for (key, value) in presets.iter() {
                    overrides.insert(key.to_string(), (*value).into());
                }
            }
            None => {
                tracing::warn!(
                    "Unknown scheduler variant '{}', using algorithm defaults",
                    scheduler_variant
                );
                fallbacks.push(CatalogFallback::UnknownVariant {
                    requested: scheduler_variant.to_string(),
                });
            }
        }

        for (key, value) in sampler_presets.iter() {
            overrides
                .entry(key.to_string())
                .or_insert_with(|| (*value).into());
        }

        if let Some((algorithm_type, order)) = solver_overrides(&sampler_key) {
            overrides.insert(ALGORITHM_TYPE.to_string(), algorithm_type.into());
            overrides.insert(SOLVER_ORDER.to_string(), order.into());
        }

        let config = instantiate(algorithm, overrides, base_config, &mut fallbacks);

        tracing::debug!(
            "Resolved sampler '{}' / '{}' to {} with {:?}",
            sampler_name,
            scheduler_variant,
            algorithm,
            config
        );

        SchedulerSpec {
            algorithm,
            config,
            fallbacks,
        }
    }
}

impl Default for SchedulerCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve with the default catalog
pub fn resolve(
    sampler_name: &str,
    scheduler_variant: &str,
    base_config: Option<&SchedulerConfig>,
) -> SchedulerSpec {
    SchedulerCatalog::new().resolve(sampler_name, scheduler_variant, base_config)
}

fn solver_overrides(sampler_key: &str) -> Option<(&'static str, i64)> {
    if PLAIN_MULTISTEP.contains(&sampler_key) {
        Some((DPMSOLVER_PLUS_PLUS, 2))
    } else if sampler_key.contains("sde") {
        let order = if sampler_key.contains("3m") { 3 } else { 2 };
        Some((SDE_DPMSOLVER_PLUS_PLUS, order))
    } else {
        None
    }
}

fn instantiate(
    algorithm: SchedulerAlgorithm,
    overrides: SchedulerConfig,
    base_config: Option<&SchedulerConfig>,
    fallbacks: &mut Vec<CatalogFallback>,
) -> SchedulerConfig {
    let rejected: Vec<String> = overrides
        .keys()
        .filter(|key| !algorithm.accepts(key))
        .cloned()
        .collect();

    match base_config {
        Some(base) => {
            // Building from an existing config ignores keys the algorithm does not take
            let mut config = base.clone();
            for (key, value) in overrides {
                if algorithm.accepts(&key) {
                    config.insert(key, value);
                }
            }
            if !rejected.is_empty() {
                tracing::debug!("{} ignored override keys {:?}", algorithm, rejected);
                fallbacks.push(CatalogFallback::UnsupportedSchedulerOption {
                    algorithm,
                    rejected,
                    retried_with_defaults: false,
                });
            }
            config
        }
        None if rejected.is_empty() => overrides,
        None => {
            tracing::warn!(
                "{} rejected override keys {:?}, constructing with defaults",
                algorithm,
                rejected
            );
            fallbacks.push(CatalogFallback::UnsupportedSchedulerOption {
                algorithm,
                rejected,
                retried_with_defaults: true,
            });
            SchedulerConfig::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Euler a"), "euler_a");
        assert_eq!(normalize_name(" euler-a "), "euler_a");
        assert_eq!(normalize_name("DPM++  2M   Karras"), "dpm++_2m_karras");
        assert_eq!(normalize_name("dpmpp__2m"), "dpmpp_2m");
        assert_eq!(normalize_name(""), "");
    }

    #[test]
    fn test_spelling_variants_share_algorithm() {
        let catalog = SchedulerCatalog::new();
        let families: Vec<_> = ["euler_a", "euler a", "euler-a", "Euler A", "EULER_A"]
            .iter()
            .map(|name| catalog.resolve(name, "normal", None).algorithm)
            .collect();
        assert!(families
            .iter()
            .all(|a| *a == SchedulerAlgorithm::EulerAncestralDiscrete));

        let a = catalog.resolve("dpm++ 2m sde", "karras", None);
        let b = catalog.resolve("dpm++-2m-sde", "karras", None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_sde_solver_orders() {
        let catalog = SchedulerCatalog::new();
        for name in [
            "dpmpp_sde",
            "dpmpp_2m_sde",
            "dpmpp_sde_gpu",
            "dpmpp_2m_sde_gpu",
            "dpm++ sde",
            "dpm++ 2m sde karras",
        ] {
            let spec = catalog.resolve(name, "normal", None);
            assert_eq!(spec.solver_order(), Some(2), "{}", name);
            assert_eq!(spec.algorithm_type(), Some(SDE_DPMSOLVER_PLUS_PLUS), "{}", name);
        }
        for name in ["dpmpp_3m_sde", "dpmpp_3m_sde_gpu", "dpm++ 3m sde"] {
            let spec = catalog.resolve(name, "normal", None);
            assert_eq!(spec.solver_order(), Some(3), "{}", name);
        }
    }

    #[test]
    fn test_sde_gpu_with_karras() {
        let spec = resolve("dpmpp_2m_sde_gpu", "karras", None);
        assert_eq!(spec.algorithm, SchedulerAlgorithm::DpmSolverMultistep);
        assert!(spec.use_karras_sigmas());
        assert_eq!(spec.algorithm_type(), Some(SDE_DPMSOLVER_PLUS_PLUS));
        assert_eq!(spec.solver_order(), Some(2));
        assert!(spec.is_exact());
    }

    #[test]
    fn test_plain_multistep_forces_standard_algorithm() {
        let spec = resolve("dpmpp_2m", "sgm_uniform", None);
        assert_eq!(spec.algorithm_type(), Some(DPMSOLVER_PLUS_PLUS));
        assert_eq!(spec.solver_order(), Some(2));
        assert_eq!(spec.timestep_spacing(), Some("trailing"));
    }

    #[test]
    fn test_ancestral_2s_adds_karras_unless_variant_sets_it() {
        let spec = resolve("dpmpp_2s_a", "normal", None);
        assert!(spec.use_karras_sigmas());
        assert_eq!(spec.algorithm_type(), Some(DPMSOLVER_PLUS_PLUS));

        let spec = resolve("dpmpp_2s_a", "simple", None);
        assert!(spec.use_karras_sigmas());
        assert_eq!(spec.timestep_spacing(), Some("leading"));
    }

    #[test]
    fn test_unknown_sampler_falls_back() {
        let spec = resolve("eulr", "normal", None);
        assert_eq!(spec.algorithm, SchedulerAlgorithm::DEFAULT);
        assert!(matches!(
            spec.fallbacks.as_slice(),
            [CatalogFallback::UnknownSampler { requested, .. }] if requested == "eulr"
        ));

        let catalog = SchedulerCatalog::new().with_default_algorithm(SchedulerAlgorithm::Ddim);
        assert_eq!(catalog.resolve("", "normal", None).algorithm, SchedulerAlgorithm::Ddim);
    }

    #[test]
    fn test_unknown_variant_has_no_overrides() {
        let spec = resolve("euler", "polyexponential", None);
        assert_eq!(spec.algorithm, SchedulerAlgorithm::EulerDiscrete);
        assert!(spec.config.is_empty());
        assert!(matches!(
            spec.fallbacks.as_slice(),
            [CatalogFallback::UnknownVariant { .. }]
        ));
    }

    #[test]
    fn test_rejected_option_retries_with_defaults() {
        // Ancestral Euler has no karras sigma option
        let spec = resolve("euler_a", "karras", None);
        assert_eq!(spec.algorithm, SchedulerAlgorithm::EulerAncestralDiscrete);
        assert!(spec.config.is_empty());
        assert!(matches!(
            spec.fallbacks.as_slice(),
            [CatalogFallback::UnsupportedSchedulerOption {
                retried_with_defaults: true,
                ..
            }]
        ));
    }

    #[test]
    fn test_base_config_is_preserved_under_overrides() {
        let mut base = SchedulerConfig::new();
        base.insert("beta_start".into(), 0.00085.into());
        base.insert("beta_end".into(), 0.012.into());
        base.insert(TIMESTEP_SPACING.into(), "leading".into());
        base.insert(SOLVER_ORDER.into(), 1i64.into());

        let spec = resolve("dpmpp_3m_sde", "sgm_uniform", Some(&base));
        assert_eq!(spec.get("beta_start"), Some(&OverrideValue::Float(0.00085)));
        assert_eq!(spec.get("beta_end"), Some(&OverrideValue::Float(0.012)));
        assert_eq!(spec.timestep_spacing(), Some("trailing"));
        assert_eq!(spec.solver_order(), Some(3));
        assert!(spec.is_exact());
    }

    #[test]
    fn test_base_config_drops_only_unsupported_keys() {
        let mut base = SchedulerConfig::new();
        base.insert("beta_schedule".into(), "scaled_linear".into());

        let spec = resolve("ddim", "karras", Some(&base));
        assert_eq!(spec.algorithm, SchedulerAlgorithm::Ddim);
        assert_eq!(spec.beta_schedule(), Some("scaled_linear"));
        assert!(!spec.use_karras_sigmas());
        assert!(matches!(
            spec.fallbacks.as_slice(),
            [CatalogFallback::UnsupportedSchedulerOption {
                retried_with_defaults: false,
                ..
            }]
        ));
    }

    #[test]
    fn test_every_catalog_entry_is_normalized() {
        for (name, _, _) in SAMPLERS {
            assert_eq!(normalize_name(name), *name);
        }
        for (name, _) in VARIANTS {
            assert_eq!(normalize_name(name), *name);
        }
    }
}
