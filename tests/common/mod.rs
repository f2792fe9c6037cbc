//! Common test utilities for integration tests
//!
//! This module contains shared test fixtures and helper functions used across
//! integration tests. These utilities are not compiled into the library.

use anyhow::Result;
use mdrun::{Engine, Runner, RunnerConfig};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tempfile::TempDir;

/// Isolated test fixture with automatic cleanup
///
/// Copies markdown fixtures into a temporary directory so tests never see
/// each other's files.
pub struct TestFixture {
    dir: TempDir,
    sources: Vec<PathBuf>,
}

impl TestFixture {
    /// Create a fixture from files under `tests/fixtures`
    pub fn new(names: &[&str]) -> Result<Self> {
        let dir = TempDir::new()?;
        let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");

        let mut sources = Vec::new();
        for name in names {
            let target = dir.path().join(name);
            std::fs::copy(fixtures.join(name), &target)?;
            sources.push(target);
        }

        Ok(Self { dir, sources })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn sources(&self) -> Vec<PathBuf> {
        self.sources.clone()
    }

    /// A runner over the fixture with the default languages and frobs
    pub fn runner(&self, expected_count: Option<usize>) -> Runner {
        self.runner_with_config(expected_count, &RunnerConfig::default())
    }

    pub fn runner_with_config(&self, expected_count: Option<usize>, config: &RunnerConfig) -> Runner {
        Runner::new(
            self.sources(),
            expected_count,
            Arc::new(config.languages()),
            config.frobs(),
        )
        .with_engine(Engine::new())
    }
}

/// Whether `program` can be started on this machine
pub fn tool_available(program: &str, version_arg: &str) -> bool {
    Command::new(program)
        .arg(version_arg)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}
