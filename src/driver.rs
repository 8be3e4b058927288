//! External process driver for the clustering preprocessor and the
//! relocation engine.
//!
//! Both tools take a control file as their single argument, run in the
//! engine directory, and signal success through exit status plus the output
//! files they leave behind. Their stdout/stderr is decoded as UTF-8 text
//! (lossy, fixed contract) before anything downstream sees it; raw bytes
//! never cross this boundary. Failures are fatal for the stage and carry
//! the captured output; nothing is retried, the tools are deterministic for
//! identical inputs.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{RelocError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n--- stderr ---\n{}", self.stdout, self.stderr)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExternalDriver {
    timeout: Duration,
}

fn spawn_reader<R: Read + Send + 'static>(reader: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut reader) = reader {
            let _ = reader.read_to_end(&mut buffer);
        }
        buffer
    })
}

fn collect_output(
    stdout: thread::JoinHandle<Vec<u8>>,
    stderr: thread::JoinHandle<Vec<u8>>,
) -> ProcessOutput {
    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();
    ProcessOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    }
}

impl ExternalDriver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Runs one external stage to completion and verifies it produced the
    /// files the next stage needs.
    pub fn run_stage(
        &self,
        stage: &'static str,
        executable: &Path,
        control_file: &str,
        cwd: &Path,
        expected_outputs: &[&str],
    ) -> Result<ProcessOutput> {
        info!(stage, executable = %executable.display(), "invoking external tool");
        let mut child = Command::new(executable)
            .arg(control_file)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RelocError::Engine {
                stage,
                reason: format!("failed to start {}: {e}", executable.display()),
                output: String::new(),
            })?;

        let stdout_reader = spawn_reader(child.stdout.take());
        let stderr_reader = spawn_reader(child.stderr.take());

        let status = match self.wait_with_timeout(&mut child)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                let output = collect_output(stdout_reader, stderr_reader);
                return Err(RelocError::Engine {
                    stage,
                    reason: format!("timed out after {:?} and was killed", self.timeout),
                    output: output.combined(),
                });
            }
        };
        let output = collect_output(stdout_reader, stderr_reader);
        debug!(stage, %status, "external tool finished");

        if !status.success() {
            return Err(RelocError::Engine {
                stage,
                reason: format!("exited with {status}"),
                output: output.combined(),
            });
        }
        for name in expected_outputs {
            if !cwd.join(name).exists() {
                return Err(RelocError::Engine {
                    stage,
                    reason: format!("expected output file {name} was not written"),
                    output: output.combined(),
                });
            }
        }
        Ok(output)
    }

    fn wait_with_timeout(&self, child: &mut Child) -> Result<Option<std::process::ExitStatus>> {
        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            if started.elapsed() >= self.timeout {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

#[cfg(all(test, target_family = "unix"))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn driver() -> ExternalDriver {
        ExternalDriver::new(Duration::from_secs(10))
    }

    #[test]
    fn successful_stage_returns_decoded_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let exe = write_script(dir.path(), "tool", "echo clustering done\ntouch done.marker\n");
        let output = driver()
            .run_stage("ph2dt", &exe, "ph2dt.inp", dir.path(), &["done.marker"])
            .unwrap();
        assert!(output.stdout.contains("clustering done"));
    }

    #[test]
    fn non_zero_exit_surfaces_captured_output() {
        let dir = tempfile::tempdir().unwrap();
        let exe = write_script(dir.path(), "tool", "echo bad station file 1>&2\nexit 3\n");
        let err = driver()
            .run_stage("ph2dt", &exe, "ph2dt.inp", dir.path(), &[])
            .unwrap_err();
        match err {
            RelocError::Engine { stage, output, .. } => {
                assert_eq!(stage, "ph2dt");
                assert!(output.contains("bad station file"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_expected_output_is_an_engine_error() {
        let dir = tempfile::tempdir().unwrap();
        let exe = write_script(dir.path(), "tool", "exit 0\n");
        let err = driver()
            .run_stage("hypoDD", &exe, "hypoDD.inp", dir.path(), &["hypoDD.reloc"])
            .unwrap_err();
        match err {
            RelocError::Engine { reason, .. } => assert!(reason.contains("hypoDD.reloc")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn timeout_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let exe = write_script(dir.path(), "tool", "sleep 30\n");
        let driver = ExternalDriver::new(Duration::from_millis(300));
        let started = Instant::now();
        let err = driver
            .run_stage("hypoDD", &exe, "hypoDD.inp", dir.path(), &[])
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        match err {
            RelocError::Engine { reason, .. } => assert!(reason.contains("timed out")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
