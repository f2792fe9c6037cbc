use crate::runnable::Runnable;
use anyhow::{bail, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::env::consts::EXE_SUFFIX;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// One step of a frob's plan.
///
/// Arguments may contain `{{FILE}}`, `{{DIR}}`, `{{BASENAME}}`, `{{EXT}}` and
/// `{{NAMEBASE}}` placeholders, expanded by the engine once the block has been
/// written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The main command is the example itself; the others are build steps.
    pub main: bool,
    pub args: Vec<String>,
}

impl Command {
    pub fn main<S: Into<String>>(args: impl IntoIterator<Item = S>) -> Self {
        Self {
            main: true,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn auxiliary<S: Into<String>>(args: impl IntoIterator<Item = S>) -> Self {
        Self {
            main: false,
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// A per-language strategy for turning a runnable into a running process.
///
/// # Implementations
///
/// - [`InterpretedFrob`] - hands the file to an interpreter
/// - [`CompiledFrob`] - builds an executable, then runs it
/// - [`StructuredFrob`] - derives the file name from the source (Java classes)
/// - [`ConfiguredFrob`] - declared in the configuration file
pub trait Frob: fmt::Debug + Send + Sync {
    /// File extension of the materialized source, without the dot.
    fn extension(&self) -> &str;

    /// Checks whether the block can be run by this frob at all.
    ///
    /// An error here means the block is skipped, not that it failed.
    fn can_execute(&self, runnable: &Runnable) -> Result<()>;

    fn temp_file_name(&self, runnable: &Runnable) -> String;

    /// Extra environment variables for every command.
    fn environ(&self, runnable: &Runnable) -> Vec<(String, String)>;

    fn commands(&self, runnable: &Runnable) -> Vec<Command>;
}

fn ensure_source(runnable: &Runnable) -> Result<()> {
    if runnable.lines.iter().all(|line| line.trim().is_empty()) {
        bail!("empty source");
    }
    Ok(())
}

/// Runs the block with `<interpreter> -- <file>`.
#[derive(Debug, Clone)]
pub struct InterpretedFrob {
    extension: String,
    env: Vec<(String, String)>,
    template: Vec<String>,
}

impl InterpretedFrob {
    pub fn new(extension: &str, interpreter: &str) -> Self {
        Self {
            extension: extension.to_string(),
            env: Vec::new(),
            template: vec![
                interpreter.to_string(),
                "--".to_string(),
                "{{FILE}}".to_string(),
            ],
        }
    }
}

impl Frob for InterpretedFrob {
    fn extension(&self) -> &str {
        &self.extension
    }

    fn can_execute(&self, runnable: &Runnable) -> Result<()> {
        ensure_source(runnable)
    }

    fn temp_file_name(&self, _runnable: &Runnable) -> String {
        format!("example.{}", self.extension)
    }

    fn environ(&self, _runnable: &Runnable) -> Vec<(String, String)> {
        self.env.clone()
    }

    fn commands(&self, _runnable: &Runnable) -> Vec<Command> {
        vec![Command::main(self.template.clone())]
    }
}

/// What a compiled example has to declare before it is worth building.
#[derive(Debug, Clone)]
pub enum EntryPoint {
    /// The first line must equal this, e.g. `package main`.
    FirstLine(String),
    /// Some line must match this pattern, e.g. a C `main(` definition.
    Pattern(Regex),
}

impl EntryPoint {
    fn check(&self, runnable: &Runnable) -> Result<()> {
        match self {
            EntryPoint::FirstLine(expected) => {
                let first = runnable.lines.first().map(|l| l.trim()).unwrap_or_default();
                if first != expected.as_str() {
                    bail!("first line is not {:?}: {:?}", expected, first);
                }
            }
            EntryPoint::Pattern(pattern) => {
                if !runnable.lines.iter().any(|line| pattern.is_match(line)) {
                    bail!("no line matches {:?}", pattern.as_str());
                }
            }
        }
        Ok(())
    }
}

/// Builds an executable with an auxiliary command, then runs it as the main command.
#[derive(Debug, Clone)]
pub struct CompiledFrob {
    extension: String,
    entry: EntryPoint,
    build: Vec<String>,
    run: Vec<String>,
}

impl CompiledFrob {
    pub fn new(extension: &str, entry: EntryPoint, build: Vec<String>, run: Vec<String>) -> Self {
        Self {
            extension: extension.to_string(),
            entry,
            build,
            run,
        }
    }

    /// `go build -o <namebase> <file>` followed by `<namebase>`.
    pub fn go() -> Self {
        let artifact = format!("{{{{NAMEBASE}}}}{}", EXE_SUFFIX);
        Self::new(
            "go",
            EntryPoint::FirstLine("package main".to_string()),
            vec![
                "go".to_string(),
                "build".to_string(),
                "-o".to_string(),
                artifact.clone(),
                "{{FILE}}".to_string(),
            ],
            vec![artifact],
        )
    }

    /// `cc -o <namebase> <file>` followed by `<namebase>`.
    pub fn c() -> Self {
        static MAIN_RE: OnceLock<Regex> = OnceLock::new();
        let main_re = MAIN_RE
            .get_or_init(|| Regex::new(r"\bmain\s*\(").expect("valid main regex"))
            .clone();
        let artifact = format!("{{{{NAMEBASE}}}}{}", EXE_SUFFIX);
        Self::new(
            "c",
            EntryPoint::Pattern(main_re),
            vec![
                "cc".to_string(),
                "-o".to_string(),
                artifact.clone(),
                "{{FILE}}".to_string(),
            ],
            vec![artifact],
        )
    }
}

impl Frob for CompiledFrob {
    fn extension(&self) -> &str {
        &self.extension
    }

    fn can_execute(&self, runnable: &Runnable) -> Result<()> {
        ensure_source(runnable)?;
        self.entry.check(runnable)
    }

    fn temp_file_name(&self, _runnable: &Runnable) -> String {
        format!("example.{}", self.extension)
    }

    fn environ(&self, _runnable: &Runnable) -> Vec<(String, String)> {
        Vec::new()
    }

    fn commands(&self, _runnable: &Runnable) -> Vec<Command> {
        vec![
            Command::auxiliary(self.build.clone()),
            Command::main(self.run.clone()),
        ]
    }
}

/// A frob whose file name has to match a name declared in the source.
///
/// Java is the motivating case: `public class Greeter` must live in
/// `Greeter.java` and is run as `java Greeter`.
#[derive(Debug, Clone)]
pub struct StructuredFrob {
    extension: String,
    name_pattern: Regex,
    compiler: String,
    launcher: String,
}

impl StructuredFrob {
    pub fn java() -> Self {
        static CLASS_RE: OnceLock<Regex> = OnceLock::new();
        let name_pattern = CLASS_RE
            .get_or_init(|| {
                Regex::new(r"public\s+(?:(?:final|abstract|static)\s+)*class\s+([A-Za-z_$][\w$]*)")
                    .expect("valid class regex")
            })
            .clone();
        Self {
            extension: "java".to_string(),
            name_pattern,
            compiler: "javac".to_string(),
            launcher: "java".to_string(),
        }
    }

    /// The declared name, e.g. the public class.
    pub fn derived_name(&self, runnable: &Runnable) -> Option<String> {
        self.name_pattern
            .captures(&runnable.source())
            .and_then(|captures| captures.get(1))
            .map(|name| name.as_str().to_string())
    }

    fn name_or_default(&self, runnable: &Runnable) -> String {
        self.derived_name(runnable)
            .unwrap_or_else(|| "Example".to_string())
    }
}

impl Frob for StructuredFrob {
    fn extension(&self) -> &str {
        &self.extension
    }

    fn can_execute(&self, runnable: &Runnable) -> Result<()> {
        ensure_source(runnable)?;
        if self.derived_name(runnable).is_none() {
            bail!("no public class found");
        }
        Ok(())
    }

    fn temp_file_name(&self, runnable: &Runnable) -> String {
        format!("{}.{}", self.name_or_default(runnable), self.extension)
    }

    fn environ(&self, _runnable: &Runnable) -> Vec<(String, String)> {
        Vec::new()
    }

    fn commands(&self, runnable: &Runnable) -> Vec<Command> {
        vec![
            Command::auxiliary([self.compiler.as_str(), "{{BASENAME}}"]),
            Command::main([self.launcher.clone(), self.name_or_default(runnable)]),
        ]
    }
}

/// A frob declared in `mdrun.toml`.
#[derive(Debug, Clone)]
pub struct ConfiguredFrob {
    extension: String,
    file_name: Option<String>,
    commands: Vec<Command>,
    env: Vec<(String, String)>,
}

impl ConfiguredFrob {
    pub fn new(
        extension: &str,
        file_name: Option<String>,
        commands: Vec<Command>,
        env: Vec<(String, String)>,
    ) -> Self {
        Self {
            extension: extension.to_string(),
            file_name,
            commands,
            env,
        }
    }
}

impl Frob for ConfiguredFrob {
    fn extension(&self) -> &str {
        &self.extension
    }

    fn can_execute(&self, runnable: &Runnable) -> Result<()> {
        ensure_source(runnable)
    }

    fn temp_file_name(&self, _runnable: &Runnable) -> String {
        self.file_name
            .clone()
            .unwrap_or_else(|| format!("example.{}", self.extension))
    }

    fn environ(&self, _runnable: &Runnable) -> Vec<(String, String)> {
        self.env.clone()
    }

    fn commands(&self, _runnable: &Runnable) -> Vec<Command> {
        self.commands.clone()
    }
}

/// Frobs indexed by canonical language name.
///
/// The registry is a plain value handed to the [`Runner`](crate::Runner), so
/// tests and embedders can build their own without touching global state.
#[derive(Debug, Clone, Default)]
pub struct FrobRegistry {
    frobs: BTreeMap<String, Arc<dyn Frob>>,
}

impl FrobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in frobs.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.insert("bash", InterpretedFrob::new("bash", "bash"));
        registry.insert("c", CompiledFrob::c());
        registry.insert("go", CompiledFrob::go());
        registry.insert("java", StructuredFrob::java());
        registry.insert("javascript", InterpretedFrob::new("js", "node"));
        registry.insert("json", InterpretedFrob::new("json", "node"));
        registry.insert("python", InterpretedFrob::new("py", "python"));
        registry.insert("ruby", InterpretedFrob::new("rb", "ruby"));
        registry.insert("shell", InterpretedFrob::new("bash", "bash"));
        registry.insert("sh", InterpretedFrob::new("sh", "sh"));
        registry.insert("zsh", InterpretedFrob::new("zsh", "zsh"));
        registry
    }

    /// Adds or replaces the frob for `language`.
    pub fn insert(&mut self, language: &str, frob: impl Frob + 'static) -> Option<Arc<dyn Frob>> {
        self.frobs.insert(language.to_lowercase(), Arc::new(frob))
    }

    pub fn remove(&mut self, language: &str) -> Option<Arc<dyn Frob>> {
        self.frobs.remove(&language.to_lowercase())
    }

    pub fn get(&self, language: &str) -> Option<Arc<dyn Frob>> {
        self.frobs.get(&language.to_lowercase()).cloned()
    }

    /// Canonical language names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.frobs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.frobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frobs.is_empty()
    }
}
