use crate::frob::Frob;
use crate::interrupt::{StopOutcome, StopPolicy};
use crate::runnable::{ExpectedOutput, Runnable, Tags};
use anyhow::{bail, Context, Result};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

/// Environment variable that keeps temporary directories around for inspection.
pub const PRESERVE_TMPFILES_VAR: &str = "MDRUN_PRESERVE_TMPFILES";

/// How long pipes of a stopped process are drained before giving up.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// How a single block ended.
#[derive(Debug)]
pub enum Outcome {
    Passed,
    /// Not run at all, e.g. restricted to another platform.
    Skipped(String),
    Failed(anyhow::Error),
}

/// Result of executing one runnable.
#[derive(Debug)]
pub struct ExecutionResult {
    runnable: Runnable,
    index: usize,
    exit_code: i32,
    stdout: String,
    stderr: String,
    outcome: Outcome,
    duration: Duration,
}

impl ExecutionResult {
    fn skipped(index: usize, runnable: &Runnable, reason: String) -> Self {
        Self {
            runnable: runnable.clone(),
            index,
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            outcome: Outcome::Skipped(reason),
            duration: Duration::ZERO,
        }
    }

    pub fn runnable(&self) -> &Runnable {
        &self.runnable
    }

    /// 1-based position of the block among the eligible blocks of its source.
    pub fn index(&self) -> usize {
        self.index
    }

    /// `0` on success, `-1` when the block never ran to completion, the
    /// process exit code otherwise.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn error(&self) -> Option<&anyhow::Error> {
        match &self.outcome {
            Outcome::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn skip_reason(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Skipped(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Passed)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, Outcome::Skipped(_))
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// The failure, annotated with the block's location.
    pub fn into_error(self) -> Option<anyhow::Error> {
        let location = self.runnable.to_string();
        match self.outcome {
            Outcome::Failed(err) => Some(err.context(location)),
            _ => None,
        }
    }
}

/// Values substituted into `{{NAME}}` tokens of command templates.
///
/// The Go template spelling `{{.NAME}}` is accepted as well.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholders {
    values: Vec<(&'static str, String)>,
}

impl Placeholders {
    pub fn new(file: &Path, extension: &str) -> Self {
        let file_str = file.to_string_lossy().into_owned();
        let dir = file
            .parent()
            .map(|dir| dir.to_string_lossy().into_owned())
            .unwrap_or_default();
        let basename = file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let namebase = file_str
            .strip_suffix(&format!(".{}", extension))
            .unwrap_or(&file_str)
            .to_string();

        Self {
            values: vec![
                ("BASENAME", basename),
                ("DIR", dir),
                ("EXT", extension.to_string()),
                ("FILE", file_str),
                ("NAMEBASE", namebase),
            ],
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Replaces every placeholder in `template`.
    ///
    /// An unknown placeholder name is an error; a `{{` without a closing `}}`
    /// is kept literally.
    pub fn expand(&self, template: &str) -> Result<String> {
        let mut expanded = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start + 2..].find("}}") else {
                break;
            };
            let name = rest[start + 2..start + 2 + len].trim();
            let name = name.strip_prefix('.').unwrap_or(name);
            let value = self
                .get(name)
                .with_context(|| format!("Unknown placeholder {:?} in {:?}", name, template))?;

            expanded.push_str(&rest[..start]);
            expanded.push_str(value);
            rest = &rest[start + 2 + len + 2..];
        }

        expanded.push_str(rest);
        Ok(expanded)
    }

    /// `MDRUN_FILE`, `FILE`, and so on for every placeholder.
    pub fn environ(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .flat_map(|(name, value)| {
                [
                    (format!("MDRUN_{}", name), value.clone()),
                    (name.to_string(), value.clone()),
                ]
            })
            .collect()
    }
}

/// Restores the previous working directory when dropped.
struct WorkdirGuard {
    previous: PathBuf,
}

impl WorkdirGuard {
    fn enter(dir: &Path) -> Result<Self> {
        let previous = env::current_dir().context("Failed to read current directory")?;
        env::set_current_dir(dir)
            .with_context(|| format!("Failed to change directory to {}", dir.display()))?;
        Ok(Self { previous })
    }
}

impl Drop for WorkdirGuard {
    fn drop(&mut self) {
        if let Err(err) = env::set_current_dir(&self.previous) {
            log::warn!(
                "Failed to restore working directory {}: {}",
                self.previous.display(),
                err
            );
        }
    }
}

/// A command line after placeholder expansion.
#[derive(Debug, Clone)]
struct Invocation {
    main: bool,
    args: Vec<String>,
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.args.join(" "))
    }
}

/// What a finished command left behind.
struct Finished {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stop: Option<StopOutcome>,
}

impl Finished {
    fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    fn exit_code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    fn was_interrupted(&self) -> bool {
        self.stop.is_some_and(|stop| stop.was_induced())
    }
}

/// Materializes runnables on disk and runs them through their frob.
///
/// Blocks are executed one at a time. While a block runs, the process working
/// directory is its temporary directory.
#[derive(Debug, Clone)]
pub struct Engine {
    preserve_tmpfiles: bool,
    stop_policy: StopPolicy,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            preserve_tmpfiles: false,
            stop_policy: StopPolicy::default(),
        }
    }

    /// An engine honouring `MDRUN_PRESERVE_TMPFILES=1`.
    pub fn from_env() -> Self {
        let preserve = env::var(PRESERVE_TMPFILES_VAR)
            .map(|value| value.trim() == "1")
            .unwrap_or(false);
        Self::new().preserve_tmpfiles(preserve)
    }

    pub fn preserve_tmpfiles(mut self, preserve: bool) -> Self {
        self.preserve_tmpfiles = preserve;
        self
    }

    pub fn with_stop_policy(mut self, policy: StopPolicy) -> Self {
        self.stop_policy = policy;
        self
    }

    /// Runs one block and classifies the result.
    ///
    /// Never fails: setup problems are reported as a failed result with exit
    /// code `-1`.
    pub async fn execute(&self, index: usize, runnable: &Runnable, frob: &dyn Frob) -> ExecutionResult {
        let tags = runnable.tags();
        if !tags.is_valid_os() {
            let reason = format!(
                "restricted to {:?}, running on {}",
                tags.os(),
                env::consts::OS
            );
            log::debug!("Skipping {}: {}", runnable, reason);
            return ExecutionResult::skipped(index, runnable, reason);
        }

        let start = Instant::now();
        let (exit_code, stdout, stderr, outcome) = match self.run_block(runnable, &tags, frob).await {
            Ok(run) => {
                let stdout = run.stdout();
                let stderr = run.stderr();
                match run.verdict {
                    Ok(()) => (0, stdout, stderr, Outcome::Passed),
                    Err(err) => (run.exit_code, stdout, stderr, Outcome::Failed(err)),
                }
            }
            Err(err) => (-1, String::new(), String::new(), Outcome::Failed(err)),
        };

        ExecutionResult {
            runnable: runnable.clone(),
            index,
            exit_code,
            stdout,
            stderr,
            outcome,
            duration: start.elapsed(),
        }
    }

    /// Writes the block to `<dir>/<NNN><file name>` without running it.
    pub async fn extract(
        &self,
        index: usize,
        runnable: &Runnable,
        frob: &dyn Frob,
        dir: &Path,
    ) -> Result<PathBuf> {
        let path = dir.join(format!("{:03}{}", index, frob.temp_file_name(runnable)));
        write_source(runnable, &path).await?;
        log::info!("Extracted {} to {}", runnable, path.display());
        Ok(path)
    }

    async fn run_block(&self, runnable: &Runnable, tags: &Tags, frob: &dyn Frob) -> Result<BlockRun> {
        let expected = tags
            .expected_output()
            .map(ExpectedOutput::new)
            .transpose()?;

        let temp_dir = tempfile::Builder::new()
            .prefix("mdrun")
            .tempdir()
            .context("Failed to create temporary directory")?;
        let file = temp_dir.path().join(frob.temp_file_name(runnable));
        write_source(runnable, &file).await?;

        let placeholders = Placeholders::new(&file, frob.extension());
        let invocations = frob
            .commands(runnable)
            .into_iter()
            .map(|command| -> Result<Invocation> {
                let mut args = command
                    .args
                    .iter()
                    .map(|arg| placeholders.expand(arg))
                    .collect::<Result<Vec<_>>>()?;
                if command.main {
                    args.extend(tags.args());
                }
                if args.is_empty() {
                    bail!("Empty command for {}", runnable);
                }
                Ok(Invocation {
                    main: command.main,
                    args,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut env_vars = frob.environ(runnable);
        env_vars.extend(placeholders.environ());

        let run = {
            let _workdir = WorkdirGuard::enter(temp_dir.path())?;
            self.run_invocations(&invocations, &env_vars, temp_dir.path(), tags, expected.as_ref())
                .await
        };

        if self.preserve_tmpfiles {
            let kept = temp_dir.keep();
            log::info!("Preserving temporary files in {}", kept.display());
        } else if let Err(err) = temp_dir.close() {
            log::warn!("Failed to remove temporary directory: {}", err);
        }

        run
    }

    async fn run_invocations(
        &self,
        invocations: &[Invocation],
        env_vars: &[(String, String)],
        dir: &Path,
        tags: &Tags,
        expected: Option<&ExpectedOutput>,
    ) -> Result<BlockRun> {
        let mut last = None;

        for invocation in invocations {
            let mut command = Command::new(&invocation.args[0]);
            command
                .args(&invocation.args[1..])
                .envs(env_vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .current_dir(dir)
                .stdin(Stdio::null());

            log::debug!("Running: {}", invocation);
            let finished = match tags.interrupt().filter(|_| invocation.main) {
                Some(delay) => self.run_interruptible(command, delay, invocation).await?,
                None => run_to_completion(command, invocation).await?,
            };

            if !invocation.main {
                if let Err(err) = check_exit(&finished, invocation) {
                    return Ok(BlockRun::new(finished, Err(err)));
                }
                last = Some(finished);
                continue;
            }

            let verdict = verify(&finished, invocation, expected);
            return Ok(BlockRun::new(finished, verdict));
        }

        // A plan without a main command is judged by its last step.
        match last {
            Some(finished) => Ok(BlockRun::new(finished, Ok(()))),
            None => bail!("No commands to run"),
        }
    }

    /// Starts the main command, lets it run for `delay`, then stops it.
    async fn run_interruptible(
        &self,
        mut command: Command,
        delay: Duration,
        invocation: &Invocation,
    ) -> Result<Finished> {
        command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to start {}", invocation))?;
        let mut stdout_pipe = child.stdout.take().context("stdout was not captured")?;
        let mut stderr_pipe = child.stderr.take().context("stderr was not captured")?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let stop = {
            let drain = futures::future::try_join(
                drain_into(&mut stdout_pipe, &mut stdout),
                drain_into(&mut stderr_pipe, &mut stderr),
            );
            let teardown = self.teardown(&mut child, delay);
            tokio::pin!(drain);
            tokio::pin!(teardown);

            tokio::select! {
                drained = &mut drain => {
                    drained.context("Failed to read process output")?;
                    (&mut teardown).await?
                }
                stop = &mut teardown => {
                    let stop = stop?;
                    match tokio::time::timeout(DRAIN_GRACE, &mut drain).await {
                        Ok(drained) => {
                            drained.context("Failed to read process output")?;
                        }
                        Err(_) => log::warn!("Output of {} was not fully drained", invocation),
                    }
                    stop
                }
            }
        };

        if stop == StopOutcome::Unresponsive {
            bail!("{} did not exit after every stop request", invocation);
        }

        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for {}", invocation))?;

        Ok(Finished {
            status,
            stdout,
            stderr,
            stop: Some(stop),
        })
    }

    /// Waits up to `delay` for a natural exit before walking the stop policy.
    async fn teardown(&self, child: &mut Child, delay: Duration) -> Result<StopOutcome> {
        if let Ok(status) = tokio::time::timeout(delay, child.wait()).await {
            let status = status.context("Failed to wait for process")?;
            log::debug!("Process exited on its own with {}", status);
            return Ok(StopOutcome::AlreadyExited);
        }

        log::debug!("Interrupting process after {:?}", delay);
        self.stop_policy
            .stop(child)
            .await
            .context("Failed to stop process")
    }
}

/// A finished block together with its verdict.
struct BlockRun {
    finished: Finished,
    verdict: Result<()>,
    exit_code: i32,
}

impl BlockRun {
    fn new(finished: Finished, verdict: Result<()>) -> Self {
        let exit_code = finished.exit_code();
        Self {
            finished,
            verdict,
            exit_code,
        }
    }

    fn stdout(&self) -> String {
        self.finished.stdout()
    }

    fn stderr(&self) -> String {
        self.finished.stderr()
    }
}

async fn write_source(runnable: &Runnable, path: &Path) -> Result<()> {
    let mut source = runnable.source();
    source.push('\n');
    tokio::fs::write(path, source)
        .await
        .with_context(|| format!("Failed to write source file: {}", path.display()))
}

async fn run_to_completion(mut command: Command, invocation: &Invocation) -> Result<Finished> {
    let output = command
        .output()
        .await
        .with_context(|| format!("Failed to execute {}", invocation))?;
    Ok(Finished {
        status: output.status,
        stdout: output.stdout,
        stderr: output.stderr,
        stop: None,
    })
}

async fn drain_into<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<()> {
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn check_exit(finished: &Finished, invocation: &Invocation) -> Result<()> {
    if finished.status.success() {
        return Ok(());
    }
    let stderr = finished.stderr();
    let detail = if stderr.trim().is_empty() {
        finished.stdout()
    } else {
        stderr
    };
    bail!(
        "Command failed\nCommand: {}\nStatus: {}\n\n{}",
        invocation,
        finished.status,
        detail
    );
}

/// Output first, then the exit status.
fn verify(finished: &Finished, invocation: &Invocation, expected: Option<&ExpectedOutput>) -> Result<()> {
    if let Some(expected) = expected {
        let stdout = finished.stdout();
        if !expected.is_match(&stdout) {
            bail!(
                "Output did not match {}\nCommand: {}\n\n{}",
                expected,
                invocation,
                stdout
            );
        }
    }

    if finished.was_interrupted() {
        log::debug!("Ignoring exit status {} of interrupted {}", finished.status, invocation);
        return Ok(());
    }
    check_exit(finished, invocation)
}
