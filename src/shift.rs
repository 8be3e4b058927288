//! Elevation shift: works around the engine's mishandling of negative
//! station elevations.
//!
//! `offset = max(0, -min(station elevations))` is added to every station
//! elevation and every velocity-model layer top, and recorded in a state
//! file inside the working directory *before* any engine input referencing
//! shifted coordinates is written. The reconciler subtracts the recorded
//! offset from relocated depths.
//!
//! Idempotence policy: [`apply`] with an already-recorded applied state is a
//! no-op that returns the recorded offset; it never shifts twice. A fresh
//! pipeline run clears the recorded state first (see
//! [`clear_state`]) because it regenerates every engine input from
//! unshifted catalog data. Recomputing the offset on already-shifted
//! stations yields zero by construction, so both guards agree.

use std::fs;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::Station;
use crate::error::{RelocError, Result};
use crate::geom;
use crate::velocity::VelocityModel;
use crate::wdir::WorkingDirectory;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShiftState {
    pub offset_m: f64,
    pub applied: bool,
}

impl ShiftState {
    pub fn not_applied() -> Self {
        Self {
            offset_m: 0.0,
            applied: false,
        }
    }

    pub fn offset_km(&self) -> f64 {
        geom::m_to_km(self.offset_m)
    }
}

/// Reads the persisted state, if any. Survives process restarts, so a
/// caller resuming from an intermediate working-directory state can still
/// invert depths.
pub fn load_state(wdir: &WorkingDirectory) -> Result<Option<ShiftState>> {
    let path = wdir.shift_state_path();
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(&path)?;
    let state: ShiftState = serde_json::from_str(&contents).map_err(|e| {
        RelocError::consistency(format!("unreadable shift state {}: {e}", path.display()))
    })?;
    Ok(Some(state))
}

/// Removes a recorded state from a previous run. Called by the orchestrator
/// before shifting, since a full run regenerates every engine input.
pub fn clear_state(wdir: &WorkingDirectory) -> Result<()> {
    let path = wdir.shift_state_path();
    if path.exists() {
        fs::remove_file(&path)?;
        debug!("cleared stale shift state at {}", path.display());
    }
    Ok(())
}

fn persist(wdir: &WorkingDirectory, state: &ShiftState) -> Result<()> {
    let path = wdir.shift_state_path();
    let contents = serde_json::to_string_pretty(state)
        .map_err(|e| RelocError::consistency(format!("unserializable shift state: {e}")))?;
    fs::write(&path, contents)?;
    Ok(())
}

/// Computes and applies the uniform elevation shift, records it, and
/// returns the state. No-op when a state is already recorded as applied.
pub fn apply(
    stations: &mut [Station],
    model: &mut VelocityModel,
    wdir: &WorkingDirectory,
) -> Result<ShiftState> {
    if let Some(state) = load_state(wdir)? {
        if state.applied {
            info!(
                offset_m = state.offset_m,
                "elevation shift already recorded for this working directory; not re-applying"
            );
            return Ok(state);
        }
    }

    let min_elevation_m = stations
        .iter()
        .map(|s| s.elevation_m)
        .fold(f64::INFINITY, f64::min);
    if !min_elevation_m.is_finite() {
        return Err(RelocError::config(
            "cannot shift elevations without any stations",
        ));
    }

    let offset_m = (-min_elevation_m).max(0.0);
    if offset_m > 0.0 {
        for station in stations.iter_mut() {
            station.elevation_m += offset_m;
        }
        model.shift_depths(geom::m_to_km(offset_m));
        info!(
            offset_m,
            "shifted stations and velocity model so the lowest station sits at elevation 0"
        );
    } else {
        debug!("no station below sea level; elevation shift is zero");
    }

    let state = ShiftState {
        offset_m,
        applied: true,
    };
    // Recorded before any engine input referencing shifted coordinates
    // exists, so inversion is possible even after a crash.
    persist(wdir, &state)?;
    Ok(state)
}

/// Inverse of the forward shift, applied to an engine-reported depth.
pub fn unshift_depth_km(depth_km: f64, state: &ShiftState) -> f64 {
    if state.applied {
        depth_km - state.offset_km()
    } else {
        depth_km
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::velocity::VelocityModel;

    fn stations(elevations_m: &[f64]) -> Vec<Station> {
        elevations_m
            .iter()
            .enumerate()
            .map(|(i, &elevation_m)| Station {
                network: "XX".into(),
                code: format!("S{i}"),
                latitude_deg: 47.0,
                longitude_deg: 8.0,
                elevation_m,
            })
            .collect()
    }

    fn model() -> VelocityModel {
        VelocityModel::constant_ratio(vec![(0.0, 5.0), (10.0, 6.0)], 1.73).unwrap()
    }

    fn wdir() -> (tempfile::TempDir, WorkingDirectory) {
        let dir = tempfile::tempdir().unwrap();
        let wdir = WorkingDirectory::open(dir.path()).unwrap();
        (dir, wdir)
    }

    #[test]
    fn negative_minimum_sets_offset_and_zero_floor() {
        let (_guard, wdir) = wdir();
        let mut stations = stations(&[-50.0, 120.0, 0.0]);
        let mut model = model();
        let state = apply(&mut stations, &mut model, &wdir).unwrap();
        assert_eq!(state.offset_m, 50.0);
        assert!(state.applied);
        let min = stations
            .iter()
            .map(|s| s.elevation_m)
            .fold(f64::INFINITY, f64::min);
        assert_eq!(min, 0.0);
        assert_eq!(model.top_line(), "0.050 10.050");
    }

    #[test]
    fn all_non_negative_elevations_shift_nothing() {
        let (_guard, wdir) = wdir();
        let mut stations = stations(&[0.0, 300.0]);
        let mut model = model();
        let state = apply(&mut stations, &mut model, &wdir).unwrap();
        assert_eq!(state.offset_m, 0.0);
        assert_eq!(model.top_line(), "0.000 10.000");
    }

    #[test]
    fn second_apply_is_a_detected_no_op() {
        let (_guard, wdir) = wdir();
        let mut stations = stations(&[-25.0, 10.0]);
        let mut model = model();
        let first = apply(&mut stations, &mut model, &wdir).unwrap();
        let elevations: Vec<f64> = stations.iter().map(|s| s.elevation_m).collect();

        let second = apply(&mut stations, &mut model, &wdir).unwrap();
        assert_eq!(first, second);
        let unchanged: Vec<f64> = stations.iter().map(|s| s.elevation_m).collect();
        assert_eq!(elevations, unchanged);

        // And the offset recomputed from shifted data would be zero anyway.
        let min = unchanged.iter().copied().fold(f64::INFINITY, f64::min);
        assert_eq!((-min).max(0.0), 0.0);
    }

    #[test]
    fn state_survives_reload() {
        let (_guard, wdir) = wdir();
        let mut stations = stations(&[-75.0]);
        let mut model = model();
        apply(&mut stations, &mut model, &wdir).unwrap();
        let reloaded = load_state(&wdir).unwrap().unwrap();
        assert_eq!(reloaded.offset_m, 75.0);
        assert!(reloaded.applied);
    }

    #[test]
    fn clear_state_allows_fresh_application() {
        let (_guard, wdir) = wdir();
        let mut stations = stations(&[-10.0]);
        let mut model = model();
        apply(&mut stations, &mut model, &wdir).unwrap();
        clear_state(&wdir).unwrap();
        assert!(load_state(&wdir).unwrap().is_none());
    }

    #[test]
    fn unshift_inverts_only_when_applied() {
        let applied = ShiftState {
            offset_m: 50.0,
            applied: true,
        };
        assert!((unshift_depth_km(4.05, &applied) - 4.0).abs() < 1e-12);
        let idle = ShiftState::not_applied();
        assert_eq!(unshift_depth_km(4.05, &idle), 4.05);
    }
}
