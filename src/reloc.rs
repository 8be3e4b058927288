//! Relocation output parsing and catalog reconciliation.
//!
//! The engine's relocation file is whitespace-separated, one event per row:
//! id, latitude, longitude, depth, location errors, origin date/time,
//! magnitude, link/residual statistics, cluster id. Events present with a
//! valid row gain one appended origin (inverse-shifted depth); events the
//! engine did not relocate are left byte-identical. Unparsable rows are an
//! engine error for the run.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing::{debug, info};

use crate::catalog::{Event, Origin};
use crate::error::{RelocError, Result};
use crate::shift::{self, ShiftState};

/// Provenance tag on every appended origin.
pub const RELOCATION_METHOD: &str = "hypodd";

/// Minimum column count of a relocation row: through the magnitude field.
const MIN_FIELDS: usize = 17;

#[derive(Debug, Clone, PartialEq)]
pub struct RelocatedEvent {
    pub id: u32,
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    /// Depth as reported by the engine, still in shifted coordinates.
    pub depth_km: f64,
    pub time: DateTime<Utc>,
    pub magnitude: f64,
}

fn row_error(line_no: usize, line: &str, what: &str) -> RelocError {
    RelocError::Engine {
        stage: "hypoDD",
        reason: format!("relocation output line {line_no} {what}"),
        output: line.to_string(),
    }
}

fn parse_row(line_no: usize, line: &str) -> Result<RelocatedEvent> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < MIN_FIELDS {
        return Err(row_error(
            line_no,
            line,
            &format!("has {} fields, expected at least {MIN_FIELDS}", fields.len()),
        ));
    }
    let num = |idx: usize| -> Result<f64> {
        fields[idx]
            .parse::<f64>()
            .map_err(|_| row_error(line_no, line, &format!("field {} is not numeric", idx + 1)))
    };
    let int = |idx: usize| -> Result<u32> {
        fields[idx]
            .parse::<u32>()
            .map_err(|_| row_error(line_no, line, &format!("field {} is not an integer", idx + 1)))
    };

    let seconds = num(15)?;
    let time = Utc
        .with_ymd_and_hms(int(10)? as i32, int(11)?, int(12)?, int(13)?, int(14)?, 0)
        .single()
        .ok_or_else(|| row_error(line_no, line, "carries an invalid origin date"))?
        + Duration::microseconds((seconds * 1e6).round() as i64);

    Ok(RelocatedEvent {
        id: int(0)?,
        latitude_deg: num(1)?,
        longitude_deg: num(2)?,
        depth_km: num(3)?,
        time,
        magnitude: num(16)?,
    })
}

pub fn parse_reloc_file(path: &Path) -> Result<Vec<RelocatedEvent>> {
    let contents = fs::read_to_string(path)?;
    let mut relocated = Vec::new();
    for (i, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        relocated.push(parse_row(i + 1, line)?);
    }
    debug!(count = relocated.len(), "parsed {}", path.display());
    Ok(relocated)
}

/// Per-run outcome counters.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub total_events: usize,
    pub relocated: usize,
    pub unrelocated: usize,
    pub cross_correlation_pairs: usize,
    pub shift_offset_m: f64,
}

/// Appends a relocated origin to every event the engine solved, inverting
/// the elevation shift on depth. Events absent from `relocated` are not
/// touched; that is a per-event outcome, not an error.
pub fn reconcile(
    events: &mut [Event],
    relocated: &[RelocatedEvent],
    id_map: &BTreeMap<String, u32>,
    shift_state: &ShiftState,
) -> Result<usize> {
    let index_by_numeric: BTreeMap<u32, usize> = events
        .iter()
        .enumerate()
        .filter_map(|(i, e)| id_map.get(&e.id).map(|n| (*n, i)))
        .collect();

    let mut count = 0usize;
    for row in relocated {
        let Some(&event_index) = index_by_numeric.get(&row.id) else {
            return Err(RelocError::consistency(format!(
                "relocation output references event id {} which was never submitted",
                row.id
            )));
        };
        let event = &mut events[event_index];
        event.origins.push(Origin {
            time: row.time,
            latitude_deg: row.latitude_deg,
            longitude_deg: row.longitude_deg,
            depth_km: shift::unshift_depth_km(row.depth_km, shift_state),
            method: RELOCATION_METHOD.to_string(),
        });
        count += 1;
        debug!(event = %event.id, depth_km = row.depth_km, "appended relocated origin");
    }
    info!(
        relocated = count,
        unrelocated = events.len() - count,
        "reconciled relocation output"
    );
    Ok(count)
}
