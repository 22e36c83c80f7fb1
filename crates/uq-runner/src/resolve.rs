//! Turning the base configuration plus sampled overrides into the concrete
//! input of one solver call.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

use crate::config::{
    parse_composition, CampaignConfig, Geometry, GeometryKind, Meshing, Submodels,
    UncertainParameter,
};
use crate::distribution::{Param, ScalarSampler};
use crate::error::ConfigurationError;

/// Structural merge: nested mappings merge key by key, anything else in
/// `overrides` replaces the base value. Neither input is modified.
pub fn deep_merge(base: &Value, overrides: &Value) -> Value {
    match (base, overrides) {
        (Value::Object(base_map), Value::Object(override_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in override_map {
                let next = match merged.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (_, replacement) => replacement.clone(),
    }
}

/// Sparse nested mapping of sampled values, keyed by configuration path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct OverrideSet(Value);

impl Default for OverrideSet {
    fn default() -> Self {
        OverrideSet(Value::Object(Map::new()))
    }
}

impl OverrideSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.as_object().map_or(true, Map::is_empty)
    }

    /// Sets `value` at a JSON pointer, creating intermediate mappings.
    pub fn set(&mut self, pointer: &str, value: f64) -> Result<(), ConfigurationError> {
        let number = Number::from_f64(value).ok_or_else(|| {
            ConfigurationError::Resolution(format!(
                "sampled value for {} is not finite: {}",
                pointer, value
            ))
        })?;
        let tokens: Vec<String> = pointer
            .strip_prefix('/')
            .ok_or_else(|| {
                ConfigurationError::Resolution(format!(
                    "override path must start with '/': {}",
                    pointer
                ))
            })?
            .split('/')
            .map(decode_pointer_token)
            .collect();
        let (last, parents) = match tokens.split_last() {
            Some((last, parents)) if !last.is_empty() => (last, parents),
            _ => {
                return Err(ConfigurationError::Resolution(format!(
                    "override path names no field: {}",
                    pointer
                )))
            }
        };

        let mut cur = &mut self.0;
        for token in parents {
            let map = cur.as_object_mut().ok_or_else(|| {
                ConfigurationError::Resolution(format!(
                    "override path traverses a scalar at '{}' in {}",
                    token, pointer
                ))
            })?;
            cur = map
                .entry(token.clone())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        match cur {
            Value::Object(map) => {
                map.insert(last.clone(), Value::Number(number));
                Ok(())
            }
            _ => Err(ConfigurationError::Resolution(format!(
                "override target is not a mapping for {}",
                pointer
            ))),
        }
    }

    pub fn merged_with(&self, other: &OverrideSet) -> OverrideSet {
        OverrideSet(deep_merge(&self.0, &other.0))
    }
}

fn decode_pointer_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// One draw for each parameter, in the order given.
pub fn sample_overrides(
    parameters: &[UncertainParameter],
    rng: &mut dyn RngCore,
) -> Result<OverrideSet, ConfigurationError> {
    let mut overrides = OverrideSet::new();
    for parameter in parameters {
        let value = parameter.distribution.sample(rng);
        overrides.set(&parameter.pointer, value)?;
    }
    Ok(overrides)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedBoundaryConditions {
    pub pressure: f64,
    pub burner_temperature: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stagnation_temperature: Option<f64>,
    pub composition: String,
    /// Species flow rates in mol/s.
    pub flow_rates: BTreeMap<String, f64>,
}

/// Everything the flame solver needs for one run, with no distributions left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedInput {
    pub mechanism: String,
    pub geometry: Geometry,
    pub boundary_conditions: ResolvedBoundaryConditions,
    pub submodels: Submodels,
    pub meshing: Meshing,
}

impl ResolvedInput {
    pub fn from_config(config: &CampaignConfig) -> Result<Self, ConfigurationError> {
        let bc = &config.boundary_conditions;
        let pressure = literal(&bc.pressure, "/boundary_conditions/pressure")?;
        let burner_temperature = literal(
            &bc.burner_temperature,
            "/boundary_conditions/burner_temperature",
        )?;
        let stagnation_temperature = match (config.geometry.kind, bc.stagnation_temperature.as_ref()) {
            (GeometryKind::ImpingingJet, None) => {
                return Err(ConfigurationError::Resolution(
                    "impinging_jet geometry requires a stagnation temperature".to_string(),
                ))
            }
            (GeometryKind::ImpingingJet, Some(param)) => Some(literal(
                param,
                "/boundary_conditions/stagnation_temperature",
            )?),
            (GeometryKind::FreeFlame, _) => None,
        };

        let mut flow_rates = BTreeMap::new();
        for (species, rate) in &bc.flow_rates {
            let value = literal(rate, &format!("/boundary_conditions/flow_rates/{}", species))?;
            flow_rates.insert(species.clone(), bc.flow_rate_unit.to_mol_per_s(value));
        }

        let composition = match (bc.composition.as_deref(), bc.fuel.as_deref()) {
            (Some(composition), _) => {
                parse_composition(composition)?;
                composition.to_string()
            }
            (None, Some(fuel)) => derive_composition(&flow_rates, fuel)?,
            (None, None) => {
                return Err(ConfigurationError::Resolution(
                    "neither a composition nor a fuel to derive one from".to_string(),
                ))
            }
        };

        Ok(ResolvedInput {
            mechanism: config.mechanism.clone(),
            geometry: config.geometry.clone(),
            boundary_conditions: ResolvedBoundaryConditions {
                pressure,
                burner_temperature,
                stagnation_temperature,
                composition,
                flow_rates,
            },
            submodels: config.submodels.clone(),
            meshing: config.settings.meshing.clone(),
        })
    }
}

fn literal(param: &Param, pointer: &str) -> Result<f64, ConfigurationError> {
    param
        .literal()
        .ok_or_else(|| ConfigurationError::UnresolvedDistribution {
            pointers: vec![pointer.to_string()],
        })
}

/// Mole-ratio composition string, every species normalised by the fuel's
/// molar flow rate.
pub fn derive_composition(
    flow_rates: &BTreeMap<String, f64>,
    fuel: &str,
) -> Result<String, ConfigurationError> {
    let fuel_rate = flow_rates.get(fuel).copied().ok_or_else(|| {
        ConfigurationError::Resolution(format!("fuel '{}' has no flow rate", fuel))
    })?;
    if !(fuel_rate > 0.0) {
        return Err(ConfigurationError::Resolution(format!(
            "fuel '{}' flow rate must be positive to normalise the composition, got {}",
            fuel, fuel_rate
        )));
    }
    Ok(flow_rates
        .iter()
        .map(|(species, rate)| format!("{}: {}", species, rate / fuel_rate))
        .collect::<Vec<_>>()
        .join(", "))
}

/// Merges `overrides` into `base` and builds the solver input. Fails if any
/// field is still distribution-valued afterwards.
pub fn resolve(base: &Value, overrides: &OverrideSet) -> Result<ResolvedInput, ConfigurationError> {
    let merged = deep_merge(base, overrides.as_value());
    let mut pointers = Vec::new();
    collect_unresolved(&merged, String::new(), &mut pointers);
    if !pointers.is_empty() {
        return Err(ConfigurationError::UnresolvedDistribution { pointers });
    }
    let config: CampaignConfig = serde_json::from_value(merged)?;
    ResolvedInput::from_config(&config)
}

fn collect_unresolved(value: &Value, pointer: String, out: &mut Vec<String>) {
    match value {
        Value::Object(map) if map.get("distribution").is_some_and(Value::is_string) => {
            out.push(pointer);
        }
        Value::Object(map) => {
            for (key, child) in map {
                let token = key.replace('~', "~0").replace('/', "~1");
                collect_unresolved(child, format!("{}/{}", pointer, token), out);
            }
        }
        Value::Array(items) => {
            for (idx, child) in items.iter().enumerate() {
                collect_unresolved(child, format!("{}/{}", pointer, idx), out);
            }
        }
        _ => {}
    }
}
