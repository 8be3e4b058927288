//! Double-difference relocation pipeline driver.
//!
//! Prepares seismic events, stations and waveforms for an external
//! double-difference relocation engine, drives the clustering preprocessor
//! and the engine through their file-based protocol, and merges relocated
//! hypocenters back into the catalog as appended origins.
//!
//! The stages, in run order:
//!
//! 1. load events/stations through the capability traits in [`catalog`];
//! 2. build and validate the 1-D velocity model ([`velocity`]);
//! 3. optionally shift stations and model so no elevation is negative
//!    ([`shift`]);
//! 4. measure differential times by waveform cross-correlation ([`xcorr`]);
//! 5. render the engine's fixed-format input files ([`infiles`]);
//! 6. invoke the external tools ([`driver`]);
//! 7. parse their output and reconcile the catalog ([`reloc`]).
//!
//! [`pipeline::Relocator`] sequences the whole thing against one
//! [`wdir::WorkingDirectory`].

pub mod catalog;
pub mod config;
pub mod driver;
pub mod error;
pub mod geom;
pub mod infiles;
pub mod pipeline;
pub mod quakeml;
pub mod reloc;
pub mod shift;
pub mod velocity;
pub mod wdir;
pub mod xcorr;

pub use catalog::{Event, Origin, Phase, Pick, Station, Trace, TraceStore};
pub use config::RelocationConfig;
pub use error::{RelocError, Result};
pub use pipeline::{Collaborators, Relocator};
pub use reloc::RunSummary;
pub use shift::ShiftState;
pub use velocity::VelocityModel;
pub use wdir::WorkingDirectory;
pub use xcorr::CrossCorrelationPair;
