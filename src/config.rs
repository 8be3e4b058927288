//! Configuration surface of a relocation run.
//!
//! Loaded from a YAML file; validated in full before the pipeline touches
//! the working directory, so every rejection here is a configuration error
//! and not a half-written run.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RelocError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelocationConfig {
    pub cross_correlation: CrossCorrelationConfig,
    pub velocity_model: VelocityModelConfig,
    /// Opt-in: raise stations and model so no station elevation is negative.
    #[serde(default)]
    pub shift_stations: bool,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub solver: SolverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossCorrelationConfig {
    /// Window start, seconds before the pick.
    pub time_before_s: f64,
    /// Window end, seconds after the pick.
    pub time_after_s: f64,
    /// Largest admissible lag between the two windows, seconds.
    pub max_lag_s: f64,
    pub filter_min_freq_hz: f64,
    pub filter_max_freq_hz: f64,
    /// Channel weighting per phase, e.g. `{Z: 1.0}` for P and
    /// `{Z: 1.0, N: 1.0, E: 1.0}` for S.
    pub p_channel_weights: BTreeMap<char, f64>,
    pub s_channel_weights: BTreeMap<char, f64>,
    /// Pairs with a combined coefficient below this never leave the engine.
    pub min_coefficient: f64,
}

impl CrossCorrelationConfig {
    pub fn channel_weights(&self, phase: crate::catalog::Phase) -> &BTreeMap<char, f64> {
        match phase {
            crate::catalog::Phase::P => &self.p_channel_weights,
            crate::catalog::Phase::S => &self.s_channel_weights,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VelocityLayerConfig {
    pub depth_top_km: f64,
    pub vp_km_s: f64,
    /// Present on every layer for an explicit P+S model, absent everywhere
    /// for a constant-ratio model.
    #[serde(default)]
    pub vs_km_s: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VelocityModelConfig {
    /// Constant Vp/Vs ratio; mutually exclusive with per-layer `vs_km_s`.
    #[serde(default)]
    pub vp_vs_ratio: Option<f64>,
    pub layers: Vec<VelocityLayerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub ph2dt_executable: PathBuf,
    pub hypodd_executable: PathBuf,
    /// Wall-clock limit per external tool, seconds. Expiry kills the child
    /// and fails the stage.
    pub timeout_s: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ph2dt_executable: PathBuf::from("ph2dt"),
            hypodd_executable: PathBuf::from("hypoDD"),
            timeout_s: 3600,
        }
    }
}

/// Numeric row of `ph2dt.inp`. Distances are kilometers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    pub min_pick_weight: f64,
    /// Max event-station distance. Derived from the data when absent.
    pub max_dist_km: Option<f64>,
    /// Max hypocentral separation between linked events.
    pub max_sep_km: f64,
    pub max_neighbours: u32,
    pub min_links: u32,
    pub min_obs_per_pair: u32,
    pub max_obs_per_pair: u32,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            min_pick_weight: 0.0,
            max_dist_km: None,
            max_sep_km: 10.0,
            max_neighbours: 10,
            min_links: 8,
            min_obs_per_pair: 8,
            max_obs_per_pair: 50,
        }
    }
}

/// Solution-control row of the engine control file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Max distance between cluster centroid and station, kilometers.
    pub dist_max_km: f64,
    pub min_cc_obs_per_pair: u32,
    pub min_ct_obs_per_pair: u32,
    /// LSQR damping factor.
    pub damping: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            dist_max_km: 400.0,
            min_cc_obs_per_pair: 8,
            min_ct_obs_per_pair: 8,
            damping: 20.0,
        }
    }
}

impl RelocationConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: RelocationConfig = serde_yaml::from_str(&contents)
            .map_err(|e| RelocError::config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Full setup-time validation. Velocity-model structure is checked by
    /// the model builder; this covers everything else.
    pub fn validate(&self) -> Result<()> {
        let cc = &self.cross_correlation;
        if cc.time_before_s <= 0.0 || cc.time_after_s <= 0.0 {
            return Err(RelocError::config(
                "cross-correlation window must extend before and after the pick",
            ));
        }
        if cc.max_lag_s <= 0.0 {
            return Err(RelocError::config("max_lag_s must be positive"));
        }
        if cc.filter_min_freq_hz <= 0.0 || cc.filter_max_freq_hz <= cc.filter_min_freq_hz {
            return Err(RelocError::config(format!(
                "bandpass range [{}, {}] Hz is not a valid interval",
                cc.filter_min_freq_hz, cc.filter_max_freq_hz
            )));
        }
        if !(0.0..=1.0).contains(&cc.min_coefficient) {
            return Err(RelocError::config(format!(
                "min_coefficient {} outside [0, 1]",
                cc.min_coefficient
            )));
        }
        for (phase, weights) in [("P", &cc.p_channel_weights), ("S", &cc.s_channel_weights)] {
            if weights.is_empty() {
                return Err(RelocError::config(format!(
                    "{phase} channel weight map is empty"
                )));
            }
            if weights.values().any(|w| *w < 0.0 || !w.is_finite()) {
                return Err(RelocError::config(format!(
                    "{phase} channel weights must be finite and non-negative"
                )));
            }
            if weights.values().all(|w| *w == 0.0) {
                return Err(RelocError::config(format!(
                    "{phase} channel weights are all zero"
                )));
            }
        }
        if self.engine.timeout_s == 0 {
            return Err(RelocError::config("engine timeout must be non-zero"));
        }
        let cl = &self.clustering;
        if let Some(d) = cl.max_dist_km {
            if d <= 0.0 {
                return Err(RelocError::config("clustering max_dist_km must be positive"));
            }
        }
        if cl.max_sep_km <= 0.0 {
            return Err(RelocError::config("clustering max_sep_km must be positive"));
        }
        if cl.min_obs_per_pair > cl.max_obs_per_pair {
            return Err(RelocError::config(
                "clustering min_obs_per_pair exceeds max_obs_per_pair",
            ));
        }
        if self.solver.dist_max_km <= 0.0 {
            return Err(RelocError::config("solver dist_max_km must be positive"));
        }
        Ok(())
    }
}
