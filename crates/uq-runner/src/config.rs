//! Campaign configuration: typed YAML, validated once at load time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::distribution::{Distribution, Param};
use crate::error::ConfigurationError;
use crate::fsutil::canonical_json_digest;

pub const DEFAULT_PRESSURE_PA: f64 = 101_325.0;
pub const DEFAULT_EPISTEMIC_PARAMETER: &str = "burner_temperature";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Uq,
    Single,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Uq => "uq",
            Mode::Single => "single",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeometryKind {
    FreeFlame,
    ImpingingJet,
}

impl GeometryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeometryKind::FreeFlame => "free_flame",
            GeometryKind::ImpingingJet => "impinging_jet",
        }
    }
}

impl fmt::Display for GeometryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Geometry {
    #[serde(rename = "type")]
    pub kind: GeometryKind,
    /// Burner-to-plate distance (impinging jet) or domain length, in m.
    pub domain_width: f64,
    pub burner_diameter: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlowRateUnit {
    #[default]
    #[serde(rename = "mol/s")]
    MolPerSecond,
    #[serde(rename = "slpm")]
    Slpm,
}

impl FlowRateUnit {
    pub fn to_mol_per_s(self, value: f64) -> f64 {
        match self {
            FlowRateUnit::MolPerSecond => value,
            FlowRateUnit::Slpm => slpm_to_mol_per_s(value),
        }
    }
}

/// Standard litres per minute to mol/s, ideal gas at 273.15 K and 1e5 Pa.
pub fn slpm_to_mol_per_s(slpm: f64) -> f64 {
    (slpm * 0.001 * 1.0e5) / (60.0 * 8.314 * 273.15)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoundaryConditions {
    #[serde(default = "default_pressure")]
    pub pressure: Param,
    pub burner_temperature: Param,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stagnation_temperature: Option<Param>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composition: Option<String>,
    #[serde(default)]
    pub flow_rates: BTreeMap<String, Param>,
    #[serde(default)]
    pub flow_rate_unit: FlowRateUnit,
}

fn default_pressure() -> Param {
    Param::Literal(DEFAULT_PRESSURE_PA)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportModel {
    #[serde(rename = "mixture-averaged")]
    MixtureAveraged,
    #[serde(rename = "multicomponent")]
    Multicomponent,
    #[serde(rename = "unity-Lewis-number")]
    UnityLewisNumber,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Submodels {
    pub radiation: bool,
    pub transport: TransportModel,
    pub soret: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Meshing {
    pub grid_min_size: f64,
    pub max_grid_points: u32,
    pub ratio: f64,
    pub slope: f64,
    pub curve: f64,
    pub prune: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UqSettings {
    pub epistemic_samples: usize,
    pub aleatory_samples: usize,
    /// Fields swept on the epistemic grid. Each must be declared uniform.
    #[serde(default = "default_epistemic_parameters")]
    pub epistemic_parameters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_seconds: Option<u64>,
}

fn default_epistemic_parameters() -> Vec<String> {
    vec![DEFAULT_EPISTEMIC_PARAMETER.to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    pub meshing: Meshing,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uq: Option<UqSettings>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SolverSettings {
    /// Program and leading arguments. The artifact path is appended.
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CampaignConfig {
    pub mode: Mode,
    pub mechanism: String,
    pub geometry: Geometry,
    pub boundary_conditions: BoundaryConditions,
    pub submodels: Submodels,
    pub settings: Settings,
    #[serde(default)]
    pub solver: SolverSettings,
}

/// A distribution-valued field together with where it lives in the tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UncertainParameter {
    pub name: String,
    pub pointer: String,
    pub distribution: Distribution,
}

impl CampaignConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&raw, path)?;
        config.validate()?;
        info!(
            path = %path.display(),
            bytes = raw.len(),
            mode = config.mode.as_str(),
            "configuration loaded and validated"
        );
        Ok(config)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigurationError> {
        let config = Self::parse(raw, Path::new("<inline>"))?;
        config.validate()?;
        Ok(config)
    }

    fn parse(raw: &str, path: &Path) -> Result<Self, ConfigurationError> {
        serde_yaml::from_str(raw).map_err(|source| ConfigurationError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn uq(&self) -> Option<&UqSettings> {
        self.settings.uq.as_ref()
    }

    /// The configuration as a generic tree, the base that overrides merge into.
    pub fn to_tree(&self) -> Result<Value, ConfigurationError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn digest(&self) -> String {
        serde_json::to_value(self)
            .map(|v| canonical_json_digest(&v))
            .unwrap_or_default()
    }

    /// Every scalar field that may carry a distribution, in sampling order:
    /// pressure, burner temperature, stagnation temperature, then flow rates
    /// by species name.
    fn scalar_fields(&self) -> Vec<(String, String, &Param)> {
        let bc = &self.boundary_conditions;
        let mut fields = vec![
            (
                "pressure".to_string(),
                "/boundary_conditions/pressure".to_string(),
                &bc.pressure,
            ),
            (
                "burner_temperature".to_string(),
                "/boundary_conditions/burner_temperature".to_string(),
                &bc.burner_temperature,
            ),
        ];
        if let Some(ts) = bc.stagnation_temperature.as_ref() {
            fields.push((
                "stagnation_temperature".to_string(),
                "/boundary_conditions/stagnation_temperature".to_string(),
                ts,
            ));
        }
        for (species, rate) in &bc.flow_rates {
            fields.push((
                format!("flow_rates.{}", species),
                format!(
                    "/boundary_conditions/flow_rates/{}",
                    encode_pointer_token(species)
                ),
                rate,
            ));
        }
        fields
    }

    pub fn uncertain_parameters(&self) -> Vec<UncertainParameter> {
        self.scalar_fields()
            .into_iter()
            .filter_map(|(name, pointer, param)| {
                param.distribution().map(|d| UncertainParameter {
                    name,
                    pointer,
                    distribution: *d,
                })
            })
            .collect()
    }

    /// Splits the uncertain fields into the epistemic sweep and the aleatory
    /// draws.
    pub fn partition_parameters(
        &self,
    ) -> Result<(Vec<UncertainParameter>, Vec<UncertainParameter>), ConfigurationError> {
        let uq = self.uq().ok_or_else(|| {
            ConfigurationError::invalid("'settings.uq' is required to partition parameters")
        })?;
        let (epistemic, aleatory): (Vec<_>, Vec<_>) = self
            .uncertain_parameters()
            .into_iter()
            .partition(|p| uq.epistemic_parameters.iter().any(|name| name == &p.name));
        if epistemic.len() != uq.epistemic_parameters.len() {
            let found: Vec<&str> = epistemic.iter().map(|p| p.name.as_str()).collect();
            let missing: Vec<&str> = uq
                .epistemic_parameters
                .iter()
                .map(String::as_str)
                .filter(|name| !found.contains(name))
                .collect();
            return Err(ConfigurationError::invalid(format!(
                "epistemic parameters are not distribution-valued: {:?}",
                missing
            )));
        }
        Ok((epistemic, aleatory))
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let mut problems = Vec::new();

        if self.mechanism.trim().is_empty() {
            problems.push("'mechanism' must not be empty".to_string());
        }
        check_positive(&mut problems, "geometry.domain_width", self.geometry.domain_width);
        check_positive(
            &mut problems,
            "geometry.burner_diameter",
            self.geometry.burner_diameter,
        );

        let bc = &self.boundary_conditions;
        if self.geometry.kind == GeometryKind::ImpingingJet && bc.stagnation_temperature.is_none() {
            problems.push(
                "'boundary_conditions.stagnation_temperature' is required for impinging_jet"
                    .to_string(),
            );
        }
        if bc.flow_rates.keys().any(|k| k.trim().is_empty()) {
            problems.push("flow rate species names must not be empty".to_string());
        }
        for (name, _, param) in self.scalar_fields() {
            match param {
                Param::Literal(v) if !v.is_finite() => {
                    problems.push(format!("'{}' must be a finite number", name));
                }
                Param::Literal(_) => {}
                Param::Distributed(d) => {
                    if self.mode == Mode::Single {
                        problems.push(format!("'{}' must be a number in 'single' mode", name));
                    } else if let Some(reason) = d.check() {
                        problems.push(format!("'{}': {}", name, reason));
                    }
                }
            }
        }

        match self.mode {
            Mode::Single => self.validate_single(&mut problems),
            Mode::Uq => self.validate_uq(&mut problems),
        }

        let sub = &self.submodels;
        if sub.soret && sub.transport != TransportModel::Multicomponent {
            problems.push("'soret' can only be true if 'transport' is 'multicomponent'".to_string());
        }

        let mesh = &self.settings.meshing;
        check_positive(&mut problems, "meshing.grid_min_size", mesh.grid_min_size);
        if mesh.max_grid_points == 0 {
            problems.push("'meshing.max_grid_points' must be at least 1".to_string());
        }
        check_positive(&mut problems, "meshing.ratio", mesh.ratio);
        for (key, value) in [
            ("meshing.slope", mesh.slope),
            ("meshing.curve", mesh.curve),
            ("meshing.prune", mesh.prune),
        ] {
            if !value.is_finite() || value < 0.0 {
                problems.push(format!("'{}' must be a non-negative number", key));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigurationError::Invalid { problems })
        }
    }

    fn validate_single(&self, problems: &mut Vec<String>) {
        let bc = &self.boundary_conditions;
        let Some(composition) = bc.composition.as_deref() else {
            problems.push("'boundary_conditions.composition' is required in 'single' mode".to_string());
            return;
        };
        match parse_composition(composition) {
            Ok(species) => {
                let missing: Vec<&str> = species
                    .iter()
                    .map(|(sp, _)| sp.as_str())
                    .filter(|sp| !bc.flow_rates.contains_key(*sp))
                    .collect();
                if !missing.is_empty() {
                    problems.push(format!(
                        "composition species missing in flow_rates: {:?}",
                        missing
                    ));
                }
            }
            Err(e) => problems.push(e.to_string()),
        }
    }

    fn validate_uq(&self, problems: &mut Vec<String>) {
        let bc = &self.boundary_conditions;
        match bc.composition.as_deref() {
            Some(composition) => {
                if let Err(e) = parse_composition(composition) {
                    problems.push(e.to_string());
                }
            }
            None => match bc.fuel.as_deref() {
                None => problems.push(
                    "'boundary_conditions.fuel' is required when no composition is given"
                        .to_string(),
                ),
                Some(fuel) if !bc.flow_rates.contains_key(fuel) => {
                    problems.push(format!("fuel '{}' has no entry in flow_rates", fuel))
                }
                Some(_) => {}
            },
        }

        let Some(uq) = self.uq() else {
            problems.push("'settings.uq' is required in 'uq' mode".to_string());
            return;
        };
        if uq.epistemic_samples == 0 {
            problems.push("'settings.uq.epistemic_samples' must be at least 1".to_string());
        }
        if uq.aleatory_samples == 0 {
            problems.push("'settings.uq.aleatory_samples' must be at least 1".to_string());
        }
        if uq.workers == Some(0) {
            problems.push("'settings.uq.workers' must be at least 1".to_string());
        }
        if uq.run_timeout_seconds == Some(0) {
            problems.push("'settings.uq.run_timeout_seconds' must be at least 1".to_string());
        }
        if uq.epistemic_parameters.is_empty() {
            problems.push("'settings.uq.epistemic_parameters' must name at least one field".to_string());
        }
        let fields = self.scalar_fields();
        for name in &uq.epistemic_parameters {
            match fields.iter().find(|(field, _, _)| field == name) {
                None => problems.push(format!("unknown epistemic parameter '{}'", name)),
                Some((_, _, Param::Distributed(Distribution::Uniform { .. }))) => {}
                Some(_) => problems.push(format!(
                    "epistemic parameter '{}' must declare a uniform distribution",
                    name
                )),
            }
        }
    }
}

fn check_positive(problems: &mut Vec<String>, key: &str, value: f64) {
    if !value.is_finite() || value <= 0.0 {
        problems.push(format!("'{}' must be a positive number", key));
    }
}

fn encode_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Parses `"SP: amount, SP: amount"` into species and amounts.
pub fn parse_composition(composition: &str) -> Result<Vec<(String, f64)>, ConfigurationError> {
    let fail = |reason: String| ConfigurationError::Composition {
        composition: composition.to_string(),
        reason,
    };
    if composition.trim().is_empty() {
        return Err(fail("composition string is empty".to_string()));
    }
    let mut species = Vec::new();
    for component in composition.split(',') {
        let component = component.trim();
        let (name, amount) = component
            .split_once(':')
            .ok_or_else(|| fail(format!("component '{}' is missing ':'", component)))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(fail(format!("component '{}' has an empty species name", component)));
        }
        let amount: f64 = amount
            .trim()
            .parse()
            .map_err(|_| fail(format!("amount of '{}' is not a number", name)))?;
        species.push((name.to_string(), amount));
    }
    Ok(species)
}

/// Starter configuration written by `init`.
pub const CONFIG_TEMPLATE: &str = r#"# McKenna burner UQ campaign.
# Scalars in boundary_conditions are either a number or a distribution:
#   {distribution: uniform, min: .., max: ..}
#   {distribution: normal, mean: .., stdev: ..}
mode: uq
mechanism: ./FFCM-2/FFCM-2.yaml

geometry:
  type: impinging_jet
  domain_width: 0.02
  burner_diameter: 0.060452

boundary_conditions:
  pressure: 101325
  burner_temperature: {distribution: uniform, min: 300, max: 350}
  stagnation_temperature: {distribution: normal, mean: 345.15, stdev: 2}
  fuel: C2H4
  flow_rate_unit: slpm
  flow_rates:
    C2H4: {distribution: normal, mean: 0.652, stdev: 0.0065}
    O2: {distribution: normal, mean: 1.9635, stdev: 0.0196}
    N2: {distribution: normal, mean: 7.2930, stdev: 0.0729}
    AR: {distribution: normal, mean: 0.0935, stdev: 0.0009}

submodels:
  radiation: true
  transport: mixture-averaged
  soret: false

settings:
  output_dir: results
  meshing:
    grid_min_size: 1.0e-7
    max_grid_points: 1000
    ratio: 3
    slope: 0.06
    curve: 0.12
    prune: 0.0
  uq:
    epistemic_samples: 10
    aleatory_samples: 100
    epistemic_parameters: [burner_temperature]
    run_timeout_seconds: 3600

solver:
  command: [python, flame_solver.py]
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_single_yaml, sample_uq_yaml};

    fn problems_of(err: ConfigurationError) -> Vec<String> {
        match err {
            ConfigurationError::Invalid { problems } => problems,
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn template_is_a_valid_uq_config() {
        let config = CampaignConfig::from_yaml_str(CONFIG_TEMPLATE).expect("template must validate");
        assert_eq!(config.mode, Mode::Uq);
        assert_eq!(config.geometry.kind, GeometryKind::ImpingingJet);
        assert_eq!(config.boundary_conditions.flow_rate_unit, FlowRateUnit::Slpm);
        let uq = config.uq().expect("uq settings");
        assert_eq!(uq.epistemic_samples, 10);
        assert_eq!(uq.aleatory_samples, 100);
    }

    #[test]
    fn uncertain_parameters_follow_sampling_order() {
        let config = CampaignConfig::from_yaml_str(&sample_uq_yaml()).expect("valid");
        let names: Vec<String> = config
            .uncertain_parameters()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "burner_temperature",
                "stagnation_temperature",
                "flow_rates.C2H4",
                "flow_rates.O2"
            ]
        );
    }

    #[test]
    fn partition_separates_epistemic_from_aleatory() {
        let config = CampaignConfig::from_yaml_str(&sample_uq_yaml()).expect("valid");
        let (epistemic, aleatory) = config.partition_parameters().expect("partition");
        assert_eq!(epistemic.len(), 1);
        assert_eq!(epistemic[0].pointer, "/boundary_conditions/burner_temperature");
        assert_eq!(aleatory.len(), 3);
        assert!(aleatory
            .iter()
            .any(|p| p.pointer == "/boundary_conditions/flow_rates/C2H4"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = sample_uq_yaml().replace("mode: uq", "mode: uq\nsurplus: 1");
        let err = CampaignConfig::from_yaml_str(&raw).expect_err("unknown key");
        assert!(matches!(err, ConfigurationError::Parse { .. }), "{:?}", err);
    }

    #[test]
    fn single_mode_rejects_distributions_and_missing_species() {
        let raw = sample_single_yaml()
            .replace("burner_temperature: 320", "burner_temperature: {distribution: uniform, min: 300, max: 350}")
            .replace("AR: 0.0001", "");
        let problems = problems_of(CampaignConfig::from_yaml_str(&raw).expect_err("invalid"));
        let joined = problems.join("\n");
        assert!(joined.contains("'burner_temperature' must be a number in 'single' mode"), "{}", joined);
        assert!(joined.contains("composition species missing in flow_rates"), "{}", joined);
    }

    #[test]
    fn validation_reports_every_problem_at_once() {
        let raw = sample_uq_yaml()
            .replace("epistemic_samples: 2", "epistemic_samples: 0")
            .replace("soret: false", "soret: true")
            .replace("min: 300, max: 350", "min: 350, max: 300");
        let problems = problems_of(CampaignConfig::from_yaml_str(&raw).expect_err("invalid"));
        let joined = problems.join("\n");
        assert!(joined.contains("epistemic_samples' must be at least 1"), "{}", joined);
        assert!(joined.contains("'soret' can only be true"), "{}", joined);
        assert!(joined.contains("uniform min 350 is greater than max 300"), "{}", joined);
    }

    #[test]
    fn epistemic_parameter_must_be_uniform() {
        let raw = sample_uq_yaml().replace(
            "epistemic_parameters: [burner_temperature]",
            "epistemic_parameters: [stagnation_temperature]",
        );
        let problems = problems_of(CampaignConfig::from_yaml_str(&raw).expect_err("invalid"));
        assert!(
            problems
                .iter()
                .any(|p| p.contains("'stagnation_temperature' must declare a uniform distribution")),
            "{:?}",
            problems
        );
    }

    #[test]
    fn impinging_jet_requires_stagnation_temperature() {
        let raw = sample_uq_yaml()
            .lines()
            .filter(|l| !l.contains("stagnation_temperature"))
            .collect::<Vec<_>>()
            .join("\n");
        let problems = problems_of(CampaignConfig::from_yaml_str(&raw).expect_err("invalid"));
        assert!(problems.iter().any(|p| p.contains("stagnation_temperature' is required")));
    }

    #[test]
    fn composition_parser_accepts_spaced_entries() {
        let species = parse_composition("C2H4:1.0, O2:3.0, N2:11.14, AR:0.14").expect("parse");
        assert_eq!(species.len(), 4);
        assert_eq!(species[2], ("N2".to_string(), 11.14));
        assert!(parse_composition("").is_err());
        assert!(parse_composition("C2H4 1.0").is_err());
        assert!(parse_composition(":1.0").is_err());
        assert!(parse_composition("C2H4:lots").is_err());
    }

    #[test]
    fn slpm_conversion_matches_ideal_gas() {
        let ndot = slpm_to_mol_per_s(1.0);
        assert!((ndot - 7.339e-4).abs() < 1e-6, "{}", ndot);
        assert_eq!(FlowRateUnit::MolPerSecond.to_mol_per_s(0.5), 0.5);
    }

    #[test]
    fn digest_is_stable_and_sensitive() {
        let a = CampaignConfig::from_yaml_str(&sample_uq_yaml()).expect("valid");
        let b = CampaignConfig::from_yaml_str(&sample_uq_yaml()).expect("valid");
        assert_eq!(a.digest(), b.digest());
        let mut c = a.clone();
        c.mechanism = "other.yaml".to_string();
        assert_ne!(a.digest(), c.digest());
    }
}
