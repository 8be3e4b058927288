//! Working-directory handle.
//!
//! All pipeline state lives under one explicit root passed to every
//! component that needs it; there is no ambient global path. Engine input
//! and output files sit in `input_files/` (the external tools run with that
//! directory as CWD, so the control files can reference bare file names);
//! the reconciled catalog goes to `output_files/`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub const INPUT_DIR: &str = "input_files";
pub const OUTPUT_DIR: &str = "output_files";
pub const SHIFT_STATE_FILE: &str = "shift_state.json";

#[derive(Debug, Clone)]
pub struct WorkingDirectory {
    root: PathBuf,
}

impl WorkingDirectory {
    /// Opens (creating as needed) the run directory and its subdirectories.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(INPUT_DIR))?;
        fs::create_dir_all(root.join(OUTPUT_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory the external tools run in; their inputs and raw outputs
    /// both live here.
    pub fn engine_dir(&self) -> PathBuf {
        self.root.join(INPUT_DIR)
    }

    pub fn engine_file(&self, name: &str) -> PathBuf {
        self.engine_dir().join(name)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join(OUTPUT_DIR)
    }

    pub fn output_file(&self, name: &str) -> PathBuf {
        self.output_dir().join(name)
    }

    pub fn shift_state_path(&self) -> PathBuf {
        self.root.join(SHIFT_STATE_FILE)
    }
}
