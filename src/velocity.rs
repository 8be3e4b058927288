//! 1-D layered velocity model: validation and engine serialization.
//!
//! The engine reads at most [`MAX_LAYERS`] layers; anything above that is a
//! configuration error, never a silent truncation.

use crate::config::VelocityModelConfig;
use crate::error::{RelocError, Result};

pub const MAX_LAYERS: usize = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub depth_top_km: f64,
    pub vp_km_s: f64,
    pub vs_km_s: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ModelKind {
    /// Layered P velocities with one Vp/Vs ratio for the whole stack.
    ConstantRatio(f64),
    /// Explicit S velocity per layer.
    ExplicitS,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VelocityModel {
    layers: Vec<Layer>,
    kind: ModelKind,
}

impl VelocityModel {
    pub fn constant_ratio(layers: Vec<(f64, f64)>, vp_vs_ratio: f64) -> Result<Self> {
        if !(vp_vs_ratio.is_finite() && vp_vs_ratio > 1.0) {
            return Err(RelocError::config(format!(
                "vp/vs ratio {vp_vs_ratio} must be finite and greater than 1"
            )));
        }
        let layers = layers
            .into_iter()
            .map(|(depth_top_km, vp_km_s)| Layer {
                depth_top_km,
                vp_km_s,
                vs_km_s: None,
            })
            .collect();
        let model = Self {
            layers,
            kind: ModelKind::ConstantRatio(vp_vs_ratio),
        };
        model.validate()?;
        Ok(model)
    }

    pub fn p_and_s(layers: Vec<(f64, f64, f64)>) -> Result<Self> {
        let layers = layers
            .into_iter()
            .map(|(depth_top_km, vp_km_s, vs_km_s)| Layer {
                depth_top_km,
                vp_km_s,
                vs_km_s: Some(vs_km_s),
            })
            .collect();
        let model = Self {
            layers,
            kind: ModelKind::ExplicitS,
        };
        model.validate()?;
        Ok(model)
    }

    pub fn from_config(config: &VelocityModelConfig) -> Result<Self> {
        let any_vs = config.layers.iter().any(|l| l.vs_km_s.is_some());
        match (config.vp_vs_ratio, any_vs) {
            (Some(_), true) => Err(RelocError::config(
                "velocity model mixes vp_vs_ratio with per-layer vs_km_s; pick one form",
            )),
            (Some(ratio), false) => Self::constant_ratio(
                config
                    .layers
                    .iter()
                    .map(|l| (l.depth_top_km, l.vp_km_s))
                    .collect(),
                ratio,
            ),
            (None, _) => {
                let layers = config
                    .layers
                    .iter()
                    .map(|l| {
                        l.vs_km_s
                            .map(|vs| (l.depth_top_km, l.vp_km_s, vs))
                            .ok_or_else(|| {
                                RelocError::config(
                                    "velocity model without vp_vs_ratio needs vs_km_s on every layer",
                                )
                            })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Self::p_and_s(layers)
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(RelocError::config("velocity model has no layers"));
        }
        if self.layers.len() > MAX_LAYERS {
            return Err(RelocError::config(format!(
                "velocity model has {} layers, the engine accepts at most {MAX_LAYERS}",
                self.layers.len()
            )));
        }
        for pair in self.layers.windows(2) {
            if pair[1].depth_top_km <= pair[0].depth_top_km {
                return Err(RelocError::config(format!(
                    "layer depths must strictly increase ({} km then {} km)",
                    pair[0].depth_top_km, pair[1].depth_top_km
                )));
            }
        }
        for layer in &self.layers {
            if !(layer.vp_km_s.is_finite() && layer.vp_km_s > 0.0) {
                return Err(RelocError::config(format!(
                    "P velocity {} km/s at depth {} km is not positive",
                    layer.vp_km_s, layer.depth_top_km
                )));
            }
            if let Some(vs) = layer.vs_km_s {
                if !(vs.is_finite() && vs > 0.0) {
                    return Err(RelocError::config(format!(
                        "S velocity {vs} km/s at depth {} km is not positive",
                        layer.depth_top_km
                    )));
                }
                if vs >= layer.vp_km_s {
                    return Err(RelocError::config(format!(
                        "S velocity {vs} km/s is not below P velocity {} km/s at depth {} km",
                        layer.vp_km_s, layer.depth_top_km
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Elevation-shift hook: lowers every layer top by `offset_km`. Called
    /// once per run, with the same offset applied to the stations.
    pub(crate) fn shift_depths(&mut self, offset_km: f64) {
        for layer in &mut self.layers {
            layer.depth_top_km += offset_km;
        }
    }

    /// Per-layer Vp/Vs ratios for the control file. A constant-ratio model
    /// repeats its ratio; an explicit-S model emits `vp_i / vs_i`.
    pub fn ratio_line(&self) -> String {
        let ratios: Vec<String> = self
            .layers
            .iter()
            .map(|layer| {
                let ratio = match self.kind {
                    ModelKind::ConstantRatio(ratio) => ratio,
                    // vs is validated present for explicit-S models.
                    ModelKind::ExplicitS => {
                        layer.vp_km_s / layer.vs_km_s.unwrap_or(layer.vp_km_s)
                    }
                };
                format!("{ratio:.3}")
            })
            .collect();
        ratios.join(" ")
    }

    pub fn top_line(&self) -> String {
        let tops: Vec<String> = self
            .layers
            .iter()
            .map(|l| format!("{:.3}", l.depth_top_km))
            .collect();
        tops.join(" ")
    }

    pub fn vel_line(&self) -> String {
        let vels: Vec<String> = self
            .layers
            .iter()
            .map(|l| format!("{:.3}", l.vp_km_s))
            .collect();
        vels.join(" ")
    }
}
