//! The relocation orchestrator: owns the working directory and sequences
//! every stage from catalog loading to the reconciled output catalog.
//!
//! The pipeline is sequential and blocks on each external tool; only the
//! cross-correlation stage parallelizes internally. One run per working
//! directory at a time; callers serialize.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::catalog::{CatalogWriter, EventReader, Station, StationReader, WaveformProvider};
use crate::config::RelocationConfig;
use crate::driver::ExternalDriver;
use crate::error::{RelocError, Result};
use crate::infiles;
use crate::reloc::{self, RunSummary};
use crate::shift::{self, ShiftState};
use crate::velocity::VelocityModel;
use crate::wdir::WorkingDirectory;
use crate::xcorr;

/// The injected capability collaborators: catalog, station and waveform
/// access is behind these narrow interfaces, never a format library.
pub struct Collaborators<'a> {
    pub events: &'a dyn EventReader,
    pub stations: &'a dyn StationReader,
    pub waveforms: &'a (dyn WaveformProvider + Sync),
    pub catalog_writer: &'a dyn CatalogWriter,
}

pub struct Relocator<'a> {
    config: RelocationConfig,
    wdir: WorkingDirectory,
    io: Collaborators<'a>,
}

impl<'a> Relocator<'a> {
    pub fn new(
        config: RelocationConfig,
        wdir: WorkingDirectory,
        io: Collaborators<'a>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, wdir, io })
    }

    pub fn working_directory(&self) -> &WorkingDirectory {
        &self.wdir
    }

    /// Runs the full pipeline and writes the reconciled catalog to
    /// `output_catalog`.
    pub fn run(
        &self,
        event_files: &[PathBuf],
        station_files: &[PathBuf],
        output_catalog: &Path,
    ) -> Result<RunSummary> {
        let mut events = Vec::new();
        for path in event_files {
            events.extend(self.io.events.read_events(path)?);
        }
        if events.is_empty() {
            return Err(RelocError::config("no events loaded"));
        }
        let mut seen = BTreeSet::new();
        for event in &events {
            if !seen.insert(event.id.as_str()) {
                return Err(RelocError::consistency(format!(
                    "event id {} appears more than once across the input catalogs",
                    event.id
                )));
            }
        }

        let mut stations: Vec<Station> = Vec::new();
        for path in station_files {
            for station in self.io.stations.read_stations(path)? {
                if !stations
                    .iter()
                    .any(|s| s.catalog_id() == station.catalog_id())
                {
                    stations.push(station);
                }
            }
        }
        if stations.is_empty() {
            return Err(RelocError::config("no stations loaded"));
        }
        info!(
            events = events.len(),
            stations = stations.len(),
            "catalog loaded"
        );

        let mut model = VelocityModel::from_config(&self.config.velocity_model)?;

        // A full run regenerates every engine input from unshifted catalog
        // data, so any recorded shift from an earlier run is stale here.
        shift::clear_state(&self.wdir)?;
        let shift_state = if self.config.shift_stations {
            shift::apply(&mut stations, &mut model, &self.wdir)?
        } else {
            let min_elevation = stations
                .iter()
                .map(|s| s.elevation_m)
                .fold(f64::INFINITY, f64::min);
            if min_elevation < 0.0 {
                warn!(
                    min_elevation,
                    "stations below sea level without shift_stations; the engine mishandles negative elevations"
                );
            }
            ShiftState::not_applied()
        };

        let pairs =
            xcorr::correlate_all(&events, self.io.waveforms, &self.config.cross_correlation);
        info!(pairs = pairs.len(), "cross-correlation complete");

        let id_map = infiles::assign_numeric_ids(&events);
        infiles::write_station_dat(&self.wdir, &stations)?;
        infiles::write_phase_dat(&self.wdir, &events, &stations, &id_map)?;
        infiles::write_dt_cc(&self.wdir, &events, &stations, &pairs, &id_map)?;
        let max_dist_km = self
            .config
            .clustering
            .max_dist_km
            .unwrap_or_else(|| infiles::derive_max_dist_km(&events, &stations));
        infiles::write_ph2dt_inp(&self.wdir, &self.config.clustering, max_dist_km)?;

        let driver = ExternalDriver::new(Duration::from_secs(self.config.engine.timeout_s));
        let engine_dir = self.wdir.engine_dir();
        driver.run_stage(
            "ph2dt",
            &self.config.engine.ph2dt_executable,
            infiles::PH2DT_INP,
            &engine_dir,
            &infiles::PH2DT_OUTPUTS,
        )?;
        infiles::write_hypodd_inp(&self.wdir, &model, &self.config.solver)?;
        driver.run_stage(
            "hypoDD",
            &self.config.engine.hypodd_executable,
            infiles::HYPODD_INP,
            &engine_dir,
            &[infiles::RELOC_OUTPUT],
        )?;

        let relocated = reloc::parse_reloc_file(&self.wdir.engine_file(infiles::RELOC_OUTPUT))?;
        let relocated_count = reloc::reconcile(&mut events, &relocated, &id_map, &shift_state)?;
        self.io.catalog_writer.write_events(&events, output_catalog)?;

        let summary = RunSummary {
            total_events: events.len(),
            relocated: relocated_count,
            unrelocated: events.len() - relocated_count,
            cross_correlation_pairs: pairs.len(),
            shift_offset_m: shift_state.offset_m,
        };
        info!(
            relocated = summary.relocated,
            unrelocated = summary.unrelocated,
            "relocation run complete"
        );
        Ok(summary)
    }
}
