//! Catalog records and the capability interfaces the pipeline consumes.
//!
//! Events, picks and stations are plain tagged records; the catalog formats
//! they come from (QuakeML, StationXML, waveform files) are read and written
//! through the narrow traits at the bottom of this module, so the pipeline
//! never touches a format library directly.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Field width of the station identifier in the engine's fixed-format files.
pub const STATION_ID_MAX_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    P,
    S,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::P => "P",
            Phase::S => "S",
        }
    }

    pub fn parse(label: &str) -> Option<Phase> {
        match label.trim().to_ascii_uppercase().as_str() {
            "P" => Some(Phase::P),
            "S" => Some(Phase::S),
            _ => None,
        }
    }
}

/// A hypocenter solution. Events accumulate origins; nothing ever rewrites
/// an existing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Origin {
    pub time: DateTime<Utc>,
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub depth_km: f64,
    /// Provenance tag, e.g. "catalog" for loaded origins or "hypodd" for
    /// relocated ones.
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pick {
    /// Station identifier in `NET.STA` catalog form.
    pub station_id: String,
    pub phase: Phase,
    pub time: DateTime<Utc>,
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub origins: Vec<Origin>,
    /// Index into `origins`; loaded catalogs point this at the preferred
    /// solution, relocation never moves it.
    pub preferred_origin: usize,
    pub magnitude: Option<f64>,
    pub picks: Vec<Pick>,
}

impl Event {
    pub fn preferred_origin(&self) -> &Origin {
        &self.origins[self.preferred_origin]
    }

    pub fn pick_for(&self, station_id: &str, phase: Phase) -> Option<&Pick> {
        self.picks
            .iter()
            .find(|p| p.phase == phase && p.station_id == station_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub network: String,
    pub code: String,
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    /// Meters above sea level. Mutated at most once, by the elevation shift.
    pub elevation_m: f64,
}

impl Station {
    /// Catalog identifier, `NET.STA`. Picks reference stations by this.
    pub fn catalog_id(&self) -> String {
        format!("{}.{}", self.network, self.code)
    }

    /// Identifier written into every engine file. The engine's station field
    /// is 7 characters wide; a `NET.STA` that does not fit is written as the
    /// bare station code so the join key stays identical across files.
    pub fn engine_id(&self) -> String {
        let joined = self.catalog_id();
        if joined.len() > STATION_ID_MAX_LEN {
            self.code.clone()
        } else {
            joined
        }
    }
}

/// A waveform segment on one channel of one station.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub station_id: String,
    pub channel: char,
    pub start_time: DateTime<Utc>,
    pub sampling_rate_hz: f64,
    pub samples: Vec<f64>,
}

impl Trace {
    pub fn end_time(&self) -> DateTime<Utc> {
        let span_us = (self.samples.len() as f64 / self.sampling_rate_hz * 1e6).round() as i64;
        self.start_time + Duration::microseconds(span_us)
    }

    /// Cut the samples covering `[from, to)`, or `None` when the trace does
    /// not fully cover that window.
    pub fn slice(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Option<Trace> {
        if from >= to || from < self.start_time || to > self.end_time() {
            return None;
        }
        let offset_s = (from - self.start_time).num_microseconds()? as f64 / 1e6;
        let length_s = (to - from).num_microseconds()? as f64 / 1e6;
        let first = (offset_s * self.sampling_rate_hz).round() as usize;
        let count = (length_s * self.sampling_rate_hz).round() as usize;
        if count == 0 || first + count > self.samples.len() {
            return None;
        }
        Some(Trace {
            station_id: self.station_id.clone(),
            channel: self.channel,
            start_time: from,
            sampling_rate_hz: self.sampling_rate_hz,
            samples: self.samples[first..first + count].to_vec(),
        })
    }
}

/// Reads events (with picks) from a catalog file.
pub trait EventReader {
    fn read_events(&self, path: &Path) -> Result<Vec<Event>>;
}

/// Reads station metadata from an inventory file.
pub trait StationReader {
    fn read_stations(&self, path: &Path) -> Result<Vec<Station>>;
}

/// Serves waveform windows. `Ok(None)` means the provider has no data for
/// that station/channel/window; the caller skips, it is not an error.
pub trait WaveformProvider {
    fn waveform(
        &self,
        station_id: &str,
        channel: char,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<Trace>>;
}

/// Writes a reconciled catalog back out.
pub trait CatalogWriter {
    fn write_events(&self, events: &[Event], path: &Path) -> Result<()>;
}

/// In-memory [`WaveformProvider`]: traces are loaded up front, windows are
/// sliced on demand.
#[derive(Debug, Default)]
pub struct TraceStore {
    by_key: HashMap<(String, char), Vec<Trace>>,
}

impl TraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, trace: Trace) {
        self.by_key
            .entry((trace.station_id.clone(), trace.channel))
            .or_default()
            .push(trace);
    }

    /// Loads one trace from the plain-text exchange format: a header line
    /// `station_id channel start_time sampling_rate_hz` (RFC 3339 time)
    /// followed by one sample per line. Blank lines and `#` comments are
    /// ignored.
    pub fn load_ascii(&mut self, path: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(path)?;
        let mut lines = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'));
        let header = lines
            .next()
            .ok_or_else(|| crate::error::RelocError::catalog(path, "empty trace file"))?;
        let fields: Vec<&str> = header.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(crate::error::RelocError::catalog(
                path,
                format!("trace header needs 4 fields, found {}", fields.len()),
            ));
        }
        let channel = fields[1].chars().next().ok_or_else(|| {
            crate::error::RelocError::catalog(path, "trace header without channel")
        })?;
        let start_time = DateTime::parse_from_rfc3339(fields[2])
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| {
                crate::error::RelocError::catalog(
                    path,
                    format!("unparsable trace start time '{}'", fields[2]),
                )
            })?;
        let sampling_rate_hz = fields[3].parse::<f64>().map_err(|_| {
            crate::error::RelocError::catalog(
                path,
                format!("unparsable sampling rate '{}'", fields[3]),
            )
        })?;
        if sampling_rate_hz <= 0.0 {
            return Err(crate::error::RelocError::catalog(
                path,
                "sampling rate must be positive",
            ));
        }
        let samples = lines
            .map(|l| {
                l.parse::<f64>().map_err(|_| {
                    crate::error::RelocError::catalog(path, format!("unparsable sample '{l}'"))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        self.insert(Trace {
            station_id: fields[0].to_string(),
            channel,
            start_time,
            sampling_rate_hz,
            samples,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.by_key.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

impl WaveformProvider for TraceStore {
    fn waveform(
        &self,
        station_id: &str,
        channel: char,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<Trace>> {
        let key = (station_id.to_string(), channel);
        let Some(traces) = self.by_key.get(&key) else {
            return Ok(None);
        };
        Ok(traces.iter().find_map(|t| t.slice(from, to)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn station(network: &str, code: &str) -> Station {
        Station {
            network: network.to_string(),
            code: code.to_string(),
            latitude_deg: 0.0,
            longitude_deg: 0.0,
            elevation_m: 0.0,
        }
    }

    #[test]
    fn short_station_id_keeps_network() {
        assert_eq!(station("CH", "SULZ").engine_id(), "CH.SULZ");
    }

    #[test]
    fn long_station_id_truncates_to_code() {
        assert_eq!(station("CH", "EMMET").engine_id(), "EMMET");
        assert_eq!(station("XX", "LONGSTA").engine_id(), "LONGSTA");
    }

    #[test]
    fn trace_slice_honors_window() {
        let start = Utc.with_ymd_and_hms(2021, 3, 1, 0, 0, 0).unwrap();
        let trace = Trace {
            station_id: "CH.SULZ".into(),
            channel: 'Z',
            start_time: start,
            sampling_rate_hz: 100.0,
            samples: (0..1000).map(|i| i as f64).collect(),
        };
        let cut = trace
            .slice(start + Duration::seconds(2), start + Duration::seconds(4))
            .unwrap();
        assert_eq!(cut.samples.len(), 200);
        assert_eq!(cut.samples[0], 200.0);

        // Window reaching past the trace end yields nothing.
        assert!(trace
            .slice(start + Duration::seconds(9), start + Duration::seconds(11))
            .is_none());
    }

    #[test]
    fn load_ascii_parses_header_and_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.txt");
        std::fs::write(
            &path,
            "# demo trace\nCH.SULZ Z 2021-06-01T12:00:00Z 100.0\n0.0\n0.5\n-0.5\n",
        )
        .unwrap();
        let mut store = TraceStore::new();
        store.load_ascii(&path).unwrap();
        assert_eq!(store.len(), 1);

        let broken = dir.path().join("broken.txt");
        std::fs::write(&broken, "CH.SULZ Z notatime 100.0\n0.0\n").unwrap();
        assert!(store.load_ascii(&broken).is_err());
    }

    #[test]
    fn store_serves_only_covered_windows() {
        let start = Utc.with_ymd_and_hms(2021, 3, 1, 0, 0, 0).unwrap();
        let mut store = TraceStore::new();
        store.insert(Trace {
            station_id: "CH.SULZ".into(),
            channel: 'Z',
            start_time: start,
            sampling_rate_hz: 50.0,
            samples: vec![0.0; 500],
        });
        let hit = store
            .waveform(
                "CH.SULZ",
                'Z',
                start + Duration::seconds(1),
                start + Duration::seconds(3),
            )
            .unwrap();
        assert!(hit.is_some());
        let miss = store
            .waveform(
                "CH.SULZ",
                'N',
                start + Duration::seconds(1),
                start + Duration::seconds(3),
            )
            .unwrap();
        assert!(miss.is_none());
    }
}
