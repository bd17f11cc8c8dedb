//! Build and simulation settings parsed from a job's `config` JSON.
//!
//! Every recognized option has a default, so a partial config map is
//! filled in before rendering. Build settings are rendered into a
//! LibreLane `config.json`; simulation settings select the simulator and
//! testbench.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use validator::{Validate, ValidationError};

use crate::error::CoreError;

/// Process design kits accepted by the build flow.
pub const SUPPORTED_PDKS: &[&str] = &[
    "sky130A",
    "sky130_fd_sc_hd",
    "sky130_fd_sc_hs",
    "sky130_fd_sc_ms",
    "sky130_fd_sc_ls",
    "sky130_fd_sc_hvl",
    "gf180mcuC",
];

pub const DEFAULT_DOCKER_IMAGE: &str = "ghcr.io/librelane/librelane:latest";

// ---------------------------------------------------------------------------
// BuildSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct BuildSettings {
    /// Top module name.
    #[validate(length(min = 1, max = 128))]
    pub design_name: String,

    /// Explicit source list; empty means auto-detect.
    #[serde(default)]
    pub verilog_files: Vec<String>,

    #[serde(default = "default_pdk")]
    #[validate(custom(function = "validate_pdk"))]
    pub pdk: String,
    #[serde(default)]
    pub std_cell_library: Option<String>,

    #[serde(default = "default_flow")]
    pub flow: String,

    /// Nanoseconds.
    #[serde(default = "default_clock_period", deserialize_with = "number_or_string")]
    #[validate(range(exclusive_min = 0.0, max = 10000.0))]
    pub clock_period: f64,
    #[serde(default = "default_clock_port")]
    pub clock_port: Option<String>,

    /// `"x0 y0 x1 y1"` in microns.
    #[serde(default)]
    #[validate(custom(function = "validate_area"))]
    pub die_area: Option<String>,
    #[serde(default)]
    #[validate(custom(function = "validate_area"))]
    pub core_area: Option<String>,

    #[serde(
        default = "default_target_density",
        deserialize_with = "number_or_string"
    )]
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub pl_target_density: f64,
    #[serde(default = "default_random_seed")]
    pub pl_random_seed: i64,

    #[serde(default = "default_synth_strategy")]
    pub synth_strategy: String,
    #[serde(default = "default_max_fanout")]
    #[validate(range(min = 1))]
    pub synth_max_fanout: u32,
    #[serde(default = "yes")]
    pub synth_buffering: bool,
    #[serde(default = "yes")]
    pub synth_sizing: bool,

    #[serde(default = "default_core_util")]
    #[validate(range(min = 1, max = 100))]
    pub fp_core_util: u32,
    #[serde(default = "default_aspect_ratio")]
    #[validate(range(exclusive_min = 0.0))]
    pub fp_aspect_ratio: f64,
    #[serde(default)]
    pub fp_pdn_vpitch: Option<f64>,
    #[serde(default)]
    pub fp_pdn_hpitch: Option<f64>,

    #[serde(default = "yes")]
    pub grt_repair_antennas: bool,
    #[serde(default = "default_drt_opt_iters")]
    #[validate(range(min = 1, max = 256))]
    pub drt_opt_iters: u32,

    #[serde(default = "default_vdd_nets")]
    pub vdd_nets: Vec<String>,
    #[serde(default = "default_gnd_nets")]
    pub gnd_nets: Vec<String>,

    #[serde(default = "yes")]
    pub run_drc: bool,
    #[serde(default = "yes")]
    pub run_lvs: bool,
    #[serde(default = "yes")]
    pub run_magic_drc: bool,
    #[serde(default)]
    pub run_klayout_drc: bool,

    #[serde(default = "yes")]
    pub sta_pre_cts: bool,
    #[serde(default = "yes")]
    pub sta_post_cts: bool,

    #[serde(default = "yes")]
    pub generate_final_summary: bool,

    #[serde(default = "yes")]
    pub use_docker: bool,
    #[serde(default = "default_docker_image")]
    pub docker_image: String,

    /// Raw LibreLane keys merged last into the rendered config.
    #[serde(default)]
    pub extra_args: Option<Map<String, Value>>,
}

fn yes() -> bool {
    true
}
fn default_pdk() -> String {
    "sky130_fd_sc_hd".to_string()
}
fn default_flow() -> String {
    "Classic".to_string()
}
fn default_clock_period() -> f64 {
    10.0
}
fn default_clock_port() -> Option<String> {
    Some("clk".to_string())
}
fn default_target_density() -> f64 {
    0.5
}
fn default_random_seed() -> i64 {
    42
}
fn default_synth_strategy() -> String {
    "AREA 0".to_string()
}
fn default_max_fanout() -> u32 {
    10
}
fn default_core_util() -> u32 {
    50
}
fn default_aspect_ratio() -> f64 {
    1.0
}
fn default_drt_opt_iters() -> u32 {
    64
}
fn default_vdd_nets() -> Vec<String> {
    vec!["vccd1".to_string()]
}
fn default_gnd_nets() -> Vec<String> {
    vec!["vssd1".to_string()]
}
fn default_docker_image() -> String {
    DEFAULT_DOCKER_IMAGE.to_string()
}

fn validate_pdk(pdk: &str) -> Result<(), ValidationError> {
    if SUPPORTED_PDKS.contains(&pdk) {
        Ok(())
    } else {
        Err(ValidationError::new("unsupported_pdk"))
    }
}

fn validate_area(area: &str) -> Result<(), ValidationError> {
    parse_area(area)
        .map(|_| ())
        .ok_or_else(|| ValidationError::new("area_must_be_four_numbers"))
}

fn parse_area(area: &str) -> Option<Vec<f64>> {
    let values: Vec<f64> = area
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    (values.len() == 4).then_some(values)
}

/// Accept `10`, `10.5` or `"10"`; older configs store numbers as strings.
fn number_or_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

impl BuildSettings {
    /// Defaults for everything except the top module.
    pub fn for_design(design_name: impl Into<String>) -> Self {
        Self {
            design_name: design_name.into(),
            verilog_files: Vec::new(),
            pdk: default_pdk(),
            std_cell_library: None,
            flow: default_flow(),
            clock_period: default_clock_period(),
            clock_port: default_clock_port(),
            die_area: None,
            core_area: None,
            pl_target_density: default_target_density(),
            pl_random_seed: default_random_seed(),
            synth_strategy: default_synth_strategy(),
            synth_max_fanout: default_max_fanout(),
            synth_buffering: true,
            synth_sizing: true,
            fp_core_util: default_core_util(),
            fp_aspect_ratio: default_aspect_ratio(),
            fp_pdn_vpitch: None,
            fp_pdn_hpitch: None,
            grt_repair_antennas: true,
            drt_opt_iters: default_drt_opt_iters(),
            vdd_nets: default_vdd_nets(),
            gnd_nets: default_gnd_nets(),
            run_drc: true,
            run_lvs: true,
            run_magic_drc: true,
            run_klayout_drc: false,
            sta_pre_cts: true,
            sta_post_cts: true,
            generate_final_summary: true,
            use_docker: true,
            docker_image: default_docker_image(),
            extra_args: None,
        }
    }

    /// Parse and validate a job config map.
    pub fn from_config(config: &Value) -> Result<Self, CoreError> {
        let settings: Self = parse_config(config)?;
        settings
            .validate()
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        Ok(settings)
    }

    /// Render LibreLane `config.json` for the resolved source files.
    ///
    /// Sources are given relative to the design directory and emitted with
    /// LibreLane's `dir::` prefix.
    pub fn to_librelane_config(&self, verilog_files: &[String]) -> Value {
        let mut cfg = Map::new();
        let mut put = |key: &str, value: Value| {
            cfg.insert(key.to_string(), value);
        };

        put("DESIGN_NAME", json!(self.design_name));
        put(
            "VERILOG_FILES",
            json!(verilog_files
                .iter()
                .map(|f| format!("dir::{f}"))
                .collect::<Vec<_>>()),
        );
        put("PDK", json!(pdk_family(&self.pdk)));
        put(
            "STD_CELL_LIBRARY",
            json!(self
                .std_cell_library
                .clone()
                .unwrap_or_else(|| default_std_cell_library(&self.pdk).to_string())),
        );
        put("CLOCK_PERIOD", json!(self.clock_period));
        if let Some(port) = &self.clock_port {
            put("CLOCK_PORT", json!(port));
        }

        if let Some(area) = self.die_area.as_deref().and_then(parse_area) {
            put("FP_SIZING", json!("absolute"));
            put("DIE_AREA", json!(area));
        } else {
            put("FP_SIZING", json!("relative"));
            put("FP_CORE_UTIL", json!(self.fp_core_util));
        }
        if let Some(area) = self.core_area.as_deref().and_then(parse_area) {
            put("CORE_AREA", json!(area));
        }
        put("FP_ASPECT_RATIO", json!(self.fp_aspect_ratio));
        if let Some(pitch) = self.fp_pdn_vpitch {
            put("FP_PDN_VPITCH", json!(pitch));
        }
        if let Some(pitch) = self.fp_pdn_hpitch {
            put("FP_PDN_HPITCH", json!(pitch));
        }

        put(
            "PL_TARGET_DENSITY_PCT",
            json!((self.pl_target_density * 100.0).round() as i64),
        );
        put("PL_RANDOM_SEED", json!(self.pl_random_seed));

        put("SYNTH_STRATEGY", json!(self.synth_strategy));
        put("MAX_FANOUT_CONSTRAINT", json!(self.synth_max_fanout));
        put("SYNTH_BUFFERING", json!(self.synth_buffering));
        put("SYNTH_SIZING", json!(self.synth_sizing));

        put("GRT_REPAIR_ANTENNAS", json!(self.grt_repair_antennas));
        put("DRT_OPT_ITERS", json!(self.drt_opt_iters));

        put("VDD_NETS", json!(self.vdd_nets));
        put("GND_NETS", json!(self.gnd_nets));

        put("RUN_MAGIC_DRC", json!(self.run_drc && self.run_magic_drc));
        put("RUN_KLAYOUT_DRC", json!(self.run_drc && self.run_klayout_drc));
        put("RUN_LVS", json!(self.run_lvs));

        put("RUN_PRE_CTS_STA", json!(self.sta_pre_cts));
        put("RUN_POST_CTS_STA", json!(self.sta_post_cts));

        if let Some(extra) = &self.extra_args {
            for (key, value) in extra {
                put(key, value.clone());
            }
        }

        Value::Object(cfg)
    }
}

/// `sky130_fd_sc_hd` -> `sky130A`, `gf180mcuC` -> `gf180mcuC`.
pub fn pdk_family(pdk: &str) -> &str {
    if pdk.starts_with("sky130") {
        "sky130A"
    } else {
        pdk
    }
}

fn default_std_cell_library(pdk: &str) -> &str {
    match pdk {
        "sky130A" => "sky130_fd_sc_hd",
        "gf180mcuC" => "gf180mcu_fd_sc_mcu7t5v0",
        lib => lib,
    }
}

fn parse_config<T: serde::de::DeserializeOwned>(config: &Value) -> Result<T, CoreError> {
    let config = match config {
        Value::Null => json!({}),
        other => other.clone(),
    };
    serde_json::from_value(config).map_err(|e| CoreError::Validation(e.to_string()))
}

// ---------------------------------------------------------------------------
// Presets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct FlowPreset {
    pub name: &'static str,
    pub description: &'static str,
    pub config: BuildSettings,
}

/// Named starting points offered to clients, keyed by preset id.
pub fn flow_presets() -> BTreeMap<&'static str, FlowPreset> {
    let base = || {
        let mut settings = BuildSettings::for_design("example");
        settings.verilog_files = vec!["design.v".to_string()];
        settings
    };

    let minimal = BuildSettings {
        clock_period: 20.0,
        pl_target_density: 0.3,
        run_drc: false,
        run_lvs: false,
        ..base()
    };
    let balanced = BuildSettings {
        clock_period: 10.0,
        pl_target_density: 0.5,
        fp_core_util: 50,
        ..base()
    };
    let high_quality = BuildSettings {
        clock_period: 5.0,
        pl_target_density: 0.7,
        fp_core_util: 70,
        drt_opt_iters: 128,
        run_klayout_drc: true,
        ..base()
    };

    BTreeMap::from([
        (
            "minimal",
            FlowPreset {
                name: "Minimal Flow",
                description: "Fast flow for quick iterations and testing",
                config: minimal,
            },
        ),
        (
            "balanced",
            FlowPreset {
                name: "Balanced Flow",
                description: "Balanced between speed and quality",
                config: balanced,
            },
        ),
        (
            "high_quality",
            FlowPreset {
                name: "High Quality Flow",
                description: "Maximum quality for tape-out ready designs",
                config: high_quality,
            },
        ),
    ])
}

// ---------------------------------------------------------------------------
// SimulationSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Simulator {
    #[default]
    Verilator,
    Icarus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct SimulationSettings {
    #[serde(default)]
    pub simulator: Simulator,

    /// Testbench path relative to the workspace.
    #[serde(default = "default_testbench")]
    #[validate(length(min = 1))]
    pub testbench: String,

    /// Top module for Verilator; defaults to the testbench file stem.
    #[serde(default)]
    pub top_module: Option<String>,

    /// Explicit source list; empty means auto-detect.
    #[serde(default)]
    pub verilog_files: Vec<String>,
}

fn default_testbench() -> String {
    "testbench.v".to_string()
}

impl SimulationSettings {
    pub fn from_config(config: &Value) -> Result<Self, CoreError> {
        let settings: Self = parse_config(config)?;
        settings
            .validate()
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        Ok(settings)
    }

    pub fn top_module(&self) -> &str {
        self.top_module.as_deref().unwrap_or_else(|| {
            let file = self.testbench.rsplit('/').next().unwrap_or(&self.testbench);
            file.split('.').next().unwrap_or(file)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
