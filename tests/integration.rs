//! Integration tests for mdrun
//!
//! These tests verify the full end-to-end workflow by running the runner
//! against markdown fixtures in isolated environments.
//!
//! ## Test Architecture
//!
//! Each test uses `TestFixture` to create an isolated environment with:
//! - Temporary copies of the markdown fixtures
//! - Automatic cleanup via RAII (Drop trait)
//!
//! Executing examples changes the process working directory, so every test
//! that runs examples is `#[serial]`. Tests that need a toolchain skip
//! themselves when it is not installed.
//!
//! ## Adding New Tests
//!
//! 1. Create a new fixture in tests/fixtures/ if needed
//! 2. Use `TestFixture::new(&["fixture.md"])`
//! 3. Use `#[tokio::test]` for async tests
//! 4. Assert on the returned errors or `RunSummary`

#![cfg(unix)]

mod common;

use anyhow::Result;
use common::{tool_available, TestFixture};
use mdrun::RunnerConfig;
use serial_test::serial;

// ===== Tests =====

#[tokio::test]
#[serial]
async fn integration_passing_examples_run_successfully() -> Result<()> {
    let fixture = TestFixture::new(&["passing.md"])?;

    let summary = fixture.runner(Some(7)).run_summary().await;

    assert!(summary.count_mismatch.is_none());
    assert_eq!(summary.results.len(), 7);
    assert_eq!(summary.results.iter().filter(|r| r.is_skipped()).count(), 1);

    let interrupted = summary
        .results
        .iter()
        .find(|r| r.stdout().starts_with("listening"))
        .expect("interrupted example ran");
    assert!(interrupted.is_success());

    let errors = summary.into_errors();
    assert!(errors.is_empty(), "Unexpected errors: {:?}", errors);
    Ok(())
}

#[tokio::test]
#[serial]
async fn integration_failures_are_reported_with_location() -> Result<()> {
    let fixture = TestFixture::new(&["failing.md"])?;

    let errors = fixture.runner(None).run().await;

    assert_eq!(errors.len(), 2, "{:?}", errors);
    let messages: Vec<String> = errors.iter().map(|e| format!("{:#}", e)).collect();
    assert!(messages[0].contains("failing.md:4 (sh)"), "{}", messages[0]);
    assert!(messages[0].contains("Output did not match"));
    assert!(messages[1].contains("failing.md:8 (sh)"), "{}", messages[1]);
    assert!(messages[1].contains("about to fail"));
    Ok(())
}

#[tokio::test]
async fn integration_count_mismatch_is_single_error() -> Result<()> {
    let fixture = TestFixture::new(&["passing.md", "failing.md"])?;

    let errors = fixture.runner(Some(3)).run().await;

    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].to_string(), "example count 9 != expected 3");
    Ok(())
}

#[tokio::test]
async fn integration_missing_source_does_not_stop_others() -> Result<()> {
    let fixture = TestFixture::new(&["hello_go.md"])?;
    let mut sources = fixture.sources();
    sources.insert(0, fixture.path().join("absent.md"));

    let runner = mdrun::Runner::new(
        sources,
        None,
        std::sync::Arc::new(mdrun::Languages::builtin()),
        mdrun::FrobRegistry::with_defaults(),
    );
    let (found, errors) = runner.discover().await;

    assert_eq!(errors.len(), 1);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].examples.len(), 1);
    Ok(())
}

#[tokio::test]
#[serial]
async fn integration_go_example_builds_and_runs() -> Result<()> {
    if !tool_available("go", "version") {
        eprintln!("go not installed, skipping");
        return Ok(());
    }
    let fixture = TestFixture::new(&["hello_go.md"])?;

    let summary = fixture.runner(Some(1)).run_summary().await;

    assert_eq!(summary.results.len(), 1);
    let result = &summary.results[0];
    assert!(result.is_success(), "{:?}", result.error());
    assert_eq!(result.exit_code(), 0);
    assert!(result.stdout().contains("hi"));
    Ok(())
}

#[tokio::test]
#[serial]
async fn integration_c_example_builds_and_runs() -> Result<()> {
    if !tool_available("cc", "--version") {
        eprintln!("cc not installed, skipping");
        return Ok(());
    }
    let fixture = TestFixture::new(&["hello_c.md"])?;

    let summary = fixture.runner(Some(1)).run_summary().await;

    let result = &summary.results[0];
    assert!(result.is_success(), "{:?}", result.error());
    assert_eq!(result.stdout(), "hi\n");
    Ok(())
}

#[tokio::test]
#[serial]
async fn integration_configured_language_runs() -> Result<()> {
    let config = RunnerConfig::from_toml_str(
        r#"
[languages.shout]
aliases = ["yell"]

[frobs.shout]
extension = "sh"
interpreter = "sh"
"#,
    )?;
    let fixture = TestFixture::new(&["custom.md"])?;

    let summary = fixture.runner_with_config(Some(1), &config).run_summary().await;

    assert_eq!(summary.results.len(), 1);
    assert_eq!(summary.results[0].stdout(), "hello\n");
    assert!(summary.is_success());
    Ok(())
}

#[tokio::test]
async fn integration_extract_writes_numbered_files() -> Result<()> {
    let fixture = TestFixture::new(&["passing.md", "failing.md"])?;
    let out = fixture.path().join("extracted");

    let written = fixture.runner(None).extract(&out).await?;

    assert_eq!(written.len(), 9);
    assert!(out.join("001example.sh").is_file());
    assert!(out.join("009example.sh").is_file());
    let first = std::fs::read_to_string(out.join("001example.sh"))?;
    assert_eq!(first, "echo \"hello from sh\"\n");
    Ok(())
}
