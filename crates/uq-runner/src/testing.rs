//! Fixtures shared by the unit tests.

use chrono::Utc;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::CampaignConfig;
use crate::fsutil::{atomic_write_json_pretty, ensure_dir};
use crate::resolve::ResolvedInput;

static DIR_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub fn temp_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "uq_{}_{}_{}_{}",
        label,
        std::process::id(),
        Utc::now().timestamp_micros(),
        DIR_COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    ensure_dir(&dir).expect("temp dir");
    dir
}

pub fn write_solution(path: &Path, peak_temperature: f64) -> std::io::Result<()> {
    atomic_write_json_pretty(
        path,
        &json!({
            "solution": {
                "flame": {
                    "grid": [0.0, 0.01, 0.02],
                    "T": [300.0, peak_temperature, 400.0]
                }
            }
        }),
    )
}

pub fn sample_uq_yaml() -> String {
    r#"mode: uq
mechanism: gri30.yaml
geometry:
  type: impinging_jet
  domain_width: 0.02
  burner_diameter: 0.060452
boundary_conditions:
  burner_temperature: {distribution: uniform, min: 300, max: 350}
  stagnation_temperature: {distribution: normal, mean: 345.15, stdev: 2}
  fuel: C2H4
  flow_rates:
    C2H4: {distribution: normal, mean: 0.0005, stdev: 0.00001}
    O2: {distribution: normal, mean: 0.0015, stdev: 0.00002}
submodels:
  radiation: false
  transport: mixture-averaged
  soret: false
settings:
  meshing:
    grid_min_size: 1.0e-7
    max_grid_points: 500
    ratio: 3
    slope: 0.06
    curve: 0.12
    prune: 0.0
  uq:
    epistemic_samples: 2
    aleatory_samples: 3
    epistemic_parameters: [burner_temperature]
    seed: 7
"#
    .to_string()
}

pub fn sample_single_yaml() -> String {
    r#"mode: single
mechanism: gri30.yaml
geometry:
  type: free_flame
  domain_width: 0.02
  burner_diameter: 0.060452
boundary_conditions:
  pressure: 101325
  burner_temperature: 320
  composition: "C2H4:1.0, O2:3.0, AR:0.14"
  flow_rates:
    C2H4: 0.0005
    O2: 0.0015
    AR: 0.0001
submodels:
  radiation: true
  transport: multicomponent
  soret: true
settings:
  meshing:
    grid_min_size: 1.0e-7
    max_grid_points: 500
    ratio: 3
    slope: 0.06
    curve: 0.12
    prune: 0.0
"#
    .to_string()
}

pub fn single_input() -> ResolvedInput {
    let config = CampaignConfig::from_yaml_str(&sample_single_yaml()).expect("valid single config");
    ResolvedInput::from_config(&config).expect("resolvable")
}
