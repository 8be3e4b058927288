//! Fixed-format input files for the clustering preprocessor and the
//! relocation engine.
//!
//! Everything here writes what the external tools parse by column position,
//! so the formats are pinned by the `write_*` functions and exercised by the
//! tests below. All distances feeding numeric parameters are kilometers;
//! meters appear only where a format field demands them (station elevation).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};

use tracing::{debug, warn};

use crate::catalog::{Event, Station};
use crate::config::{ClusteringConfig, SolverConfig};
use crate::error::{RelocError, Result};
use crate::geom;
use crate::velocity::VelocityModel;
use crate::wdir::WorkingDirectory;
use crate::xcorr::CrossCorrelationPair;

pub const STATION_DAT: &str = "station.dat";
pub const PHASE_DAT: &str = "phase.dat";
pub const DT_CC: &str = "dt.cc";
pub const PH2DT_INP: &str = "ph2dt.inp";
pub const HYPODD_INP: &str = "hypoDD.inp";

/// Files ph2dt must leave behind for the relocation step.
pub const PH2DT_OUTPUTS: [&str; 2] = ["dt.ct", "event.sel"];
/// File the relocation engine must leave behind.
pub const RELOC_OUTPUT: &str = "hypoDD.reloc";

/// The engine identifies events by integer; ids are assigned by catalog
/// order, starting at 1.
pub fn assign_numeric_ids(events: &[Event]) -> BTreeMap<String, u32> {
    events
        .iter()
        .enumerate()
        .map(|(i, e)| (e.id.clone(), (i + 1) as u32))
        .collect()
}

/// Catalog station id -> engine station id, one truncation rule for every
/// file (see [`Station::engine_id`]).
pub fn engine_station_ids(stations: &[Station]) -> BTreeMap<String, String> {
    stations
        .iter()
        .map(|s| (s.catalog_id(), s.engine_id()))
        .collect()
}

pub fn write_station_dat(wdir: &WorkingDirectory, stations: &[Station]) -> Result<()> {
    let path = wdir.engine_file(STATION_DAT);
    let mut out = BufWriter::new(File::create(&path)?);
    for station in stations {
        writeln!(
            out,
            "{:<7} {:9.5} {:10.5} {:5}",
            station.engine_id(),
            station.latitude_deg,
            station.longitude_deg,
            station.elevation_m.round() as i64
        )?;
    }
    out.flush()?;
    debug!(count = stations.len(), "wrote {STATION_DAT}");
    Ok(())
}

pub fn write_phase_dat(
    wdir: &WorkingDirectory,
    events: &[Event],
    stations: &[Station],
    id_map: &BTreeMap<String, u32>,
) -> Result<()> {
    let station_ids = engine_station_ids(stations);
    let path = wdir.engine_file(PHASE_DAT);
    let mut out = BufWriter::new(File::create(&path)?);
    for event in events {
        let numeric_id = id_map.get(&event.id).ok_or_else(|| {
            RelocError::consistency(format!("event {} missing from id map", event.id))
        })?;
        let origin = event.preferred_origin();
        let t = origin.time;
        let seconds = f64::from(chrono::Timelike::second(&t))
            + f64::from(chrono::Timelike::nanosecond(&t)) / 1e9;
        writeln!(
            out,
            "# {:04} {:02} {:02} {:02} {:02} {:5.2} {:9.5} {:10.5} {:7.3} {:4.1} 0.0 0.0 0.0 {:9}",
            chrono::Datelike::year(&t),
            chrono::Datelike::month(&t),
            chrono::Datelike::day(&t),
            chrono::Timelike::hour(&t),
            chrono::Timelike::minute(&t),
            seconds,
            origin.latitude_deg,
            origin.longitude_deg,
            origin.depth_km,
            event.magnitude.unwrap_or(0.0),
            numeric_id
        )?;
        for pick in &event.picks {
            let Some(station_id) = station_ids.get(&pick.station_id) else {
                warn!(
                    station = %pick.station_id,
                    event = %event.id,
                    "pick references unknown station, dropping from {PHASE_DAT}"
                );
                continue;
            };
            let travel_time_s =
                (pick.time - origin.time).num_microseconds().unwrap_or(0) as f64 / 1e6;
            writeln!(
                out,
                "{:<7} {:8.3} {:7.4} {}",
                station_id,
                travel_time_s,
                pick.weight.unwrap_or(1.0),
                pick.phase.as_str()
            )?;
        }
    }
    out.flush()?;
    debug!(count = events.len(), "wrote {PHASE_DAT}");
    Ok(())
}

/// Differential-time observations from cross-correlation. The value per
/// observation is `(tt_a - tt_b) + lag` (see the sign convention in
/// [`crate::xcorr`]); the coefficient is carried as the observation weight.
pub fn write_dt_cc(
    wdir: &WorkingDirectory,
    events: &[Event],
    stations: &[Station],
    pairs: &[CrossCorrelationPair],
    id_map: &BTreeMap<String, u32>,
) -> Result<()> {
    let station_ids = engine_station_ids(stations);
    let by_id: BTreeMap<&str, &Event> = events.iter().map(|e| (e.id.as_str(), e)).collect();
    let path = wdir.engine_file(DT_CC);
    let mut out = BufWriter::new(File::create(&path)?);

    let mut current_pair: Option<(&str, &str)> = None;
    for pair in pairs {
        let (event_a, event_b, id_a, id_b) = match (
            by_id.get(pair.event_a.as_str()),
            by_id.get(pair.event_b.as_str()),
            id_map.get(&pair.event_a),
            id_map.get(&pair.event_b),
        ) {
            (Some(a), Some(b), Some(na), Some(nb)) => (*a, *b, *na, *nb),
            _ => {
                return Err(RelocError::consistency(format!(
                    "cross-correlation pair references unknown event {} or {}",
                    pair.event_a, pair.event_b
                )))
            }
        };
        let Some(station_id) = station_ids.get(&pair.station_id) else {
            warn!(
                station = %pair.station_id,
                "correlation pair references unknown station, dropping from {DT_CC}"
            );
            continue;
        };
        let (Some(pick_a), Some(pick_b)) = (
            event_a.pick_for(&pair.station_id, pair.phase),
            event_b.pick_for(&pair.station_id, pair.phase),
        ) else {
            return Err(RelocError::consistency(format!(
                "correlation pair {}/{} at {} lost its picks",
                pair.event_a, pair.event_b, pair.station_id
            )));
        };

        if current_pair != Some((pair.event_a.as_str(), pair.event_b.as_str())) {
            writeln!(out, "# {id_a} {id_b} 0.0")?;
            current_pair = Some((pair.event_a.as_str(), pair.event_b.as_str()));
        }
        let tt_a = (pick_a.time - event_a.preferred_origin().time)
            .num_microseconds()
            .unwrap_or(0) as f64
            / 1e6;
        let tt_b = (pick_b.time - event_b.preferred_origin().time)
            .num_microseconds()
            .unwrap_or(0) as f64
            / 1e6;
        let differential_s = (tt_a - tt_b) + pair.lag_s;
        writeln!(
            out,
            "{:<7} {:9.4} {:7.4} {}",
            station_id,
            differential_s,
            pair.coefficient,
            pair.phase.as_str()
        )?;
    }
    out.flush()?;
    debug!(count = pairs.len(), "wrote {DT_CC}");
    Ok(())
}

/// Largest event-station epicentral distance in the data set, kilometers,
/// padded by 10% and rounded up. Used for MAXDIST when the configuration
/// does not pin it.
pub fn derive_max_dist_km(events: &[Event], stations: &[Station]) -> f64 {
    let mut max_km: f64 = 0.0;
    for event in events {
        let origin = event.preferred_origin();
        for station in stations {
            let d = geom::epicentral_distance_km(
                origin.latitude_deg,
                origin.longitude_deg,
                station.latitude_deg,
                station.longitude_deg,
            );
            max_km = max_km.max(d);
        }
    }
    if max_km <= 0.0 {
        // Degenerate geometry (single co-located event/station); keep the
        // engine permissive.
        return 200.0;
    }
    (max_km * 1.1).ceil()
}

pub fn write_ph2dt_inp(
    wdir: &WorkingDirectory,
    clustering: &ClusteringConfig,
    max_dist_km: f64,
) -> Result<()> {
    let path = wdir.engine_file(PH2DT_INP);
    let mut out = BufWriter::new(File::create(&path)?);
    writeln!(out, "* ph2dt.inp - control file for program ph2dt")?;
    writeln!(out, "* Input station file:")?;
    writeln!(out, "{STATION_DAT}")?;
    writeln!(out, "* Input phase file:")?;
    writeln!(out, "{PHASE_DAT}")?;
    writeln!(
        out,
        "* MINWGHT MAXDIST MAXSEP MAXNGH MINLNK MINOBS MAXOBS"
    )?;
    writeln!(
        out,
        "  {:.1} {:.0} {:.1} {} {} {} {}",
        clustering.min_pick_weight,
        max_dist_km,
        clustering.max_sep_km,
        clustering.max_neighbours,
        clustering.min_links,
        clustering.min_obs_per_pair,
        clustering.max_obs_per_pair
    )?;
    out.flush()?;
    debug!(max_dist_km, "wrote {PH2DT_INP}");
    Ok(())
}

pub fn write_hypodd_inp(
    wdir: &WorkingDirectory,
    model: &VelocityModel,
    solver: &SolverConfig,
) -> Result<()> {
    let path = wdir.engine_file(HYPODD_INP);
    let mut out = BufWriter::new(File::create(&path)?);
    writeln!(out, "* hypoDD.inp - control file for program hypoDD")?;
    writeln!(out, "*--- input files")?;
    writeln!(out, "{DT_CC}")?;
    writeln!(out, "dt.ct")?;
    writeln!(out, "event.sel")?;
    writeln!(out, "{STATION_DAT}")?;
    writeln!(out, "*--- output files")?;
    writeln!(out, "hypoDD.loc")?;
    writeln!(out, "{RELOC_OUTPUT}")?;
    writeln!(out, "hypoDD.sta")?;
    writeln!(out, "hypoDD.res")?;
    writeln!(out, "hypoDD.src")?;
    writeln!(out, "*--- data selection: IDAT 3 = cross + catalog, IPHA 3 = P and S")?;
    writeln!(out, "* IDAT IPHA DIST")?;
    writeln!(out, "    3    3  {:.0}", solver.dist_max_km)?;
    writeln!(out, "*--- event clustering")?;
    writeln!(out, "* OBSCC OBSCT")?;
    writeln!(
        out,
        "    {}    {}",
        solver.min_cc_obs_per_pair, solver.min_ct_obs_per_pair
    )?;
    writeln!(out, "*--- solution control")?;
    writeln!(out, "* ISTART ISOLV NSET")?;
    writeln!(out, "     2     2    2")?;
    writeln!(out, "*--- data weighting per iteration set")?;
    writeln!(
        out,
        "* NITER WTCCP WTCCS WRCC WDCC WTCTP WTCTS WRCT WDCT DAMP"
    )?;
    writeln!(
        out,
        "   5  0.01  0.01  -9  -9  1.0  0.5  -9  -9  {:.0}",
        solver.damping
    )?;
    writeln!(
        out,
        "   5  1.0  0.5  6  4  0.01  0.005  6  4  {:.0}",
        solver.damping
    )?;
    writeln!(out, "*--- 1D velocity model")?;
    writeln!(out, "* NLAY RATIO")?;
    writeln!(out, "  {}  {}", model.layer_count(), model.ratio_line())?;
    writeln!(out, "* TOP")?;
    writeln!(out, "{}", model.top_line())?;
    writeln!(out, "* VEL")?;
    writeln!(out, "{}", model.vel_line())?;
    writeln!(out, "*--- cluster/event selection (0 = all clusters, blank = all events)")?;
    writeln!(out, "* CID")?;
    writeln!(out, "    0")?;
    writeln!(out, "* ID")?;
    out.flush()?;
    debug!(layers = model.layer_count(), "wrote {HYPODD_INP}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Origin, Phase, Pick};
    use chrono::{Duration, TimeZone, Utc};
    use std::fs;

    fn wdir() -> (tempfile::TempDir, WorkingDirectory) {
        let dir = tempfile::tempdir().unwrap();
        let wdir = WorkingDirectory::open(dir.path()).unwrap();
        (dir, wdir)
    }

    fn stations() -> Vec<Station> {
        vec![
            Station {
                network: "CH".into(),
                code: "SULZ".into(),
                latitude_deg: 47.52748,
                longitude_deg: 8.11153,
                elevation_m: 150.0,
            },
            Station {
                network: "XX".into(),
                code: "LONGSTA".into(),
                latitude_deg: 47.2,
                longitude_deg: 8.4,
                elevation_m: -12.0,
            },
        ]
    }

    fn events() -> Vec<Event> {
        let t0 = Utc.with_ymd_and_hms(2021, 6, 1, 12, 0, 0).unwrap();
        let mut out = Vec::new();
        for (i, station_id) in [(0u32, "CH.SULZ"), (1u32, "XX.LONGSTA")] {
            let origin_time = t0 + Duration::seconds(i64::from(i) * 600);
            out.push(Event {
                id: format!("smi:local/event/{i}"),
                origins: vec![Origin {
                    time: origin_time,
                    latitude_deg: 47.3 + f64::from(i) * 0.01,
                    longitude_deg: 8.2,
                    depth_km: 6.5,
                    method: "catalog".into(),
                }],
                preferred_origin: 0,
                magnitude: Some(1.5),
                picks: vec![
                    Pick {
                        station_id: "CH.SULZ".into(),
                        phase: Phase::P,
                        time: origin_time + Duration::milliseconds(3200),
                        weight: Some(1.0),
                    },
                    Pick {
                        station_id: station_id.into(),
                        phase: Phase::S,
                        time: origin_time + Duration::milliseconds(5600),
                        weight: None,
                    },
                ],
            });
        }
        out
    }

    #[test]
    fn station_dat_uses_engine_ids_and_integer_elevation() {
        let (_guard, wdir) = wdir();
        write_station_dat(&wdir, &stations()).unwrap();
        let contents = fs::read_to_string(wdir.engine_file(STATION_DAT)).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert!(lines[0].starts_with("CH.SULZ"));
        assert!(lines[0].contains("  150"));
        // Combined id over 7 characters falls back to the bare code.
        assert!(lines[1].starts_with("LONGSTA "));
        assert!(!lines[1].contains("XX.LONGSTA"));
    }

    #[test]
    fn phase_dat_contains_headers_travel_times_and_truncated_ids() {
        let (_guard, wdir) = wdir();
        let events = events();
        let id_map = assign_numeric_ids(&events);
        write_phase_dat(&wdir, &events, &stations(), &id_map).unwrap();
        let contents = fs::read_to_string(wdir.engine_file(PHASE_DAT)).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert!(lines[0].starts_with("# 2021 06 01 12 00"));
        assert!(lines[0].trim_end().ends_with(" 1"));
        // P travel time: 3.2 s after origin.
        assert!(lines[1].starts_with("CH.SULZ"));
        assert!(lines[1].contains("3.200"));
        // Pick on the long station id is truncated consistently.
        let s_line = lines
            .iter()
            .find(|l| l.contains("LONGSTA"))
            .expect("S pick line");
        assert!(s_line.starts_with("LONGSTA "));
    }

    #[test]
    fn dt_cc_groups_observations_and_applies_lag_correction() {
        let (_guard, wdir) = wdir();
        let events = events();
        let id_map = assign_numeric_ids(&events);
        let pairs = vec![CrossCorrelationPair {
            event_a: events[0].id.clone(),
            event_b: events[1].id.clone(),
            station_id: "CH.SULZ".into(),
            phase: Phase::P,
            lag_s: -0.05,
            coefficient: 0.87,
        }];
        write_dt_cc(&wdir, &events, &stations(), &pairs, &id_map).unwrap();
        let contents = fs::read_to_string(wdir.engine_file(DT_CC)).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "# 1 2 0.0");
        // Both travel times are 3.2 s, so the differential is just the lag.
        assert!(lines[1].starts_with("CH.SULZ"));
        assert!(lines[1].contains("-0.0500"));
        assert!(lines[1].contains("0.8700"));
        assert!(lines[1].trim_end().ends_with('P'));
    }

    #[test]
    fn dt_cc_rejects_pairs_for_unknown_events() {
        let (_guard, wdir) = wdir();
        let events = events();
        let id_map = assign_numeric_ids(&events);
        let pairs = vec![CrossCorrelationPair {
            event_a: "smi:local/event/nope".into(),
            event_b: events[1].id.clone(),
            station_id: "CH.SULZ".into(),
            phase: Phase::P,
            lag_s: 0.0,
            coefficient: 0.9,
        }];
        let err = write_dt_cc(&wdir, &events, &stations(), &pairs, &id_map).unwrap_err();
        assert!(matches!(err, RelocError::Consistency(_)));
    }

    #[test]
    fn max_dist_is_padded_and_in_kilometers() {
        let events = events();
        let stations = stations();
        let d = derive_max_dist_km(&events, &stations);
        // Largest raw separation in this geometry is ~27 km.
        assert!(d > 25.0 && d < 40.0, "derived MAXDIST {d}");
        assert_eq!(d, d.ceil());
    }

    #[test]
    fn ph2dt_inp_carries_the_numeric_row() {
        let (_guard, wdir) = wdir();
        write_ph2dt_inp(&wdir, &ClusteringConfig::default(), 123.0).unwrap();
        let contents = fs::read_to_string(wdir.engine_file(PH2DT_INP)).unwrap();
        assert!(contents.contains("station.dat"));
        assert!(contents.contains("phase.dat"));
        assert!(contents.contains("  0.0 123 10.0 10 8 8 50"));
    }

    #[test]
    fn hypodd_inp_renders_model_section() {
        let (_guard, wdir) = wdir();
        let model =
            VelocityModel::constant_ratio(vec![(0.0, 5.0), (10.0, 6.0)], 1.73).unwrap();
        write_hypodd_inp(&wdir, &model, &SolverConfig::default()).unwrap();
        let contents = fs::read_to_string(wdir.engine_file(HYPODD_INP)).unwrap();
        assert!(contents.contains("  2  1.730 1.730"));
        assert!(contents.contains("0.000 10.000"));
        assert!(contents.contains("5.000 6.000"));
        assert!(contents.contains("hypoDD.reloc"));
    }
}
