use crate::engine::{Engine, ExecutionResult};
use crate::frob::{Frob, FrobRegistry};
use crate::language::{LanguageDefinition, LanguageLookup};
use crate::runnable::Runnable;
use crate::scanner::find_runnables;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A runnable with the language and frob it resolved to.
#[derive(Debug, Clone)]
pub struct Example {
    pub runnable: Runnable,
    pub language: LanguageDefinition,
    pub frob: Arc<dyn Frob>,
}

/// Eligible examples of one source, in document order.
#[derive(Debug, Clone)]
pub struct SourceExamples {
    pub source: String,
    pub examples: Vec<Example>,
}

/// Everything a run produced.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// One entry per executed example, in execution order
    pub results: Vec<ExecutionResult>,
    /// Sources that could not be read
    pub source_errors: Vec<anyhow::Error>,
    /// Set when the number of examples differs from the expected count;
    /// nothing is executed in that case
    pub count_mismatch: Option<anyhow::Error>,
    pub duration: Duration,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.count_mismatch.is_none()
            && self.source_errors.is_empty()
            && self.results.iter().all(|r| r.error().is_none())
    }

    pub fn failed(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.results.iter().filter(|r| r.error().is_some())
    }

    /// The flat error list; a count mismatch replaces everything else.
    pub fn into_errors(self) -> Vec<anyhow::Error> {
        if let Some(mismatch) = self.count_mismatch {
            return vec![mismatch];
        }
        self.source_errors
            .into_iter()
            .chain(self.results.into_iter().filter_map(ExecutionResult::into_error))
            .collect()
    }
}

/// Discovers examples in a list of markdown sources and runs them one by one.
pub struct Runner {
    sources: Vec<PathBuf>,
    expected_count: Option<usize>,
    languages: Arc<dyn LanguageLookup>,
    frobs: FrobRegistry,
    engine: Engine,
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("sources", &self.sources)
            .field("expected_count", &self.expected_count)
            .field("frobs", &self.frobs)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl Runner {
    pub fn new(
        sources: Vec<PathBuf>,
        expected_count: Option<usize>,
        languages: Arc<dyn LanguageLookup>,
        frobs: FrobRegistry,
    ) -> Self {
        Self {
            sources,
            expected_count,
            languages,
            frobs,
            engine: Engine::from_env(),
        }
    }

    pub fn with_engine(mut self, engine: Engine) -> Self {
        self.engine = engine;
        self
    }

    /// Scans `text` and keeps the runnables some frob accepts.
    pub fn find_eligible(&self, source_name: &str, text: &str) -> Vec<Example> {
        find_runnables(source_name, text)
            .into_iter()
            .filter_map(|runnable| self.resolve(runnable))
            .collect()
    }

    fn resolve(&self, runnable: Runnable) -> Option<Example> {
        let Some(language) = self.languages.lookup(&runnable.lang) else {
            log::debug!("Skipping {}: unknown language", runnable);
            return None;
        };
        let Some(frob) = self.frobs.get(&language.name) else {
            log::debug!("Skipping {}: no frob for {}", runnable, language.name);
            return None;
        };
        if let Err(err) = frob.can_execute(&runnable) {
            log::debug!("Skipping {}: {:#}", runnable, err);
            return None;
        }
        Some(Example {
            runnable,
            language,
            frob,
        })
    }

    /// Reads and scans every source before anything is executed.
    ///
    /// Unreadable sources are returned as errors and do not stop the others.
    pub async fn discover(&self) -> (Vec<SourceExamples>, Vec<anyhow::Error>) {
        let mut found = Vec::new();
        let mut errors = Vec::new();

        for path in &self.sources {
            let source = path.display().to_string();
            match tokio::fs::read(path).await {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    let examples = self.find_eligible(&source, &text);
                    log::info!("Found {} example(s) in {}", examples.len(), source);
                    found.push(SourceExamples { source, examples });
                }
                Err(err) => {
                    errors.push(
                        anyhow::Error::new(err).context(format!("Failed to read source {}", source)),
                    );
                }
            }
        }

        (found, errors)
    }

    /// Discovers, checks the expected count, then executes sequentially.
    pub async fn run_summary(&self) -> RunSummary {
        let start = Instant::now();
        let (sources, source_errors) = self.discover().await;

        let total: usize = sources.iter().map(|s| s.examples.len()).sum();
        if let Some(expected) = self.expected_count {
            if total != expected {
                return RunSummary {
                    count_mismatch: Some(anyhow::anyhow!(
                        "example count {} != expected {}",
                        total,
                        expected
                    )),
                    duration: start.elapsed(),
                    ..RunSummary::default()
                };
            }
        }

        let mut results = Vec::with_capacity(total);
        for source in &sources {
            log::info!("Checking source: {}", source.source);
            for (i, example) in source.examples.iter().enumerate() {
                log::info!("  Running {} block #{}", example.language.name, i + 1);
                let result = self
                    .engine
                    .execute(i + 1, &example.runnable, example.frob.as_ref())
                    .await;
                log::debug!(
                    "{} finished in {:?} with exit code {}",
                    example.runnable,
                    result.duration(),
                    result.exit_code()
                );
                results.push(result);
            }
        }

        RunSummary {
            results,
            source_errors,
            count_mismatch: None,
            duration: start.elapsed(),
        }
    }

    pub async fn run(&self) -> Vec<anyhow::Error> {
        self.run_summary().await.into_errors()
    }

    /// Writes every eligible example into `out_dir` instead of running it.
    ///
    /// Files are numbered across all sources so that names never collide.
    pub async fn extract(&self, out_dir: &Path) -> Result<Vec<PathBuf>> {
        if out_dir.exists() && !out_dir.is_dir() {
            anyhow::bail!(
                "output path {} must be a directory or nonexistent",
                out_dir.display()
            );
        }
        tokio::fs::create_dir_all(out_dir)
            .await
            .with_context(|| format!("Failed to create output directory {}", out_dir.display()))?;

        let (sources, source_errors) = self.discover().await;
        if let Some(err) = source_errors.into_iter().next() {
            return Err(err);
        }

        let mut written = Vec::new();
        for example in sources.iter().flat_map(|s| s.examples.iter()) {
            let path = self
                .engine
                .extract(written.len() + 1, &example.runnable, example.frob.as_ref(), out_dir)
                .await
                .with_context(|| example.runnable.to_string())?;
            written.push(path);
        }
        Ok(written)
    }

    /// Every fence tag that leads to a frob, sorted.
    pub fn known_aliases(&self) -> BTreeSet<String> {
        self.frobs
            .names()
            .filter_map(|name| self.languages.lookup(name))
            .flat_map(|language| language.aliases)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frob::InterpretedFrob;
    use crate::language::Languages;
    use serial_test::serial;

    const DOC: &str = r#"# Demo

```sh
echo one
```

```text
not code
```

```go
package lib
```

```cobol
DISPLAY 'HI'.
```

<!-- {"output": "two"} -->
```sh
echo two
```
"#;

    fn runner(sources: Vec<PathBuf>, expected: Option<usize>) -> Runner {
        let mut frobs = FrobRegistry::new();
        frobs.insert("sh", InterpretedFrob::new("sh", "sh"));
        frobs.insert("go", crate::frob::CompiledFrob::go());
        Runner::new(sources, expected, Arc::new(Languages::builtin()), frobs)
            .with_engine(Engine::new())
    }

    fn write_doc(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_find_eligible_filters_blocks() {
        let examples = runner(Vec::new(), None).find_eligible("DOC.md", DOC);
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[0].runnable.lines, vec!["echo one"]);
        assert_eq!(examples[1].runnable.tags().expected_output(), Some("two"));
        assert!(examples.iter().all(|e| e.language.name == "sh"));
    }

    #[tokio::test]
    async fn test_count_mismatch_replaces_results() {
        let dir = tempfile::tempdir().unwrap();
        let doc = write_doc(dir.path(), "DOC.md", DOC);

        let errors = runner(vec![doc], Some(3)).run().await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "example count 2 != expected 3");
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn test_run_collects_failures() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_doc(dir.path(), "GOOD.md", DOC);
        let bad = write_doc(dir.path(), "BAD.md", "```sh\nexit 1\n```\n");
        let missing = dir.path().join("MISSING.md");

        let summary = runner(vec![good, missing, bad], Some(3)).run_summary().await;
        assert_eq!(summary.results.len(), 3);
        assert_eq!(summary.source_errors.len(), 1);
        assert_eq!(summary.failed().count(), 1);
        assert!(!summary.is_success());

        let errors = summary.into_errors();
        assert_eq!(errors.len(), 2);
        assert!(format!("{:#}", errors[1]).contains("BAD.md:1 (sh)"));
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn test_run_success() {
        let dir = tempfile::tempdir().unwrap();
        let doc = write_doc(dir.path(), "DOC.md", DOC);
        let errors = runner(vec![doc], None).run().await;
        assert!(errors.is_empty(), "{:?}", errors);
    }

    #[tokio::test]
    async fn test_extract_numbers_across_sources() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_doc(dir.path(), "A.md", DOC);
        let second = write_doc(dir.path(), "B.md", "```sh\necho three\n```\n");
        let out = dir.path().join("out");

        let written = runner(vec![first, second], None)
            .extract(&out)
            .await
            .unwrap();
        let names: Vec<_> = written
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["001example.sh", "002example.sh", "003example.sh"]);
        assert_eq!(
            std::fs::read_to_string(&written[2]).unwrap(),
            "echo three\n"
        );
    }

    #[tokio::test]
    async fn test_extract_rejects_file_output() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_doc(dir.path(), "A.md", DOC);
        let err = runner(vec![file.clone()], None)
            .extract(&file)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("must be a directory"));
    }

    #[test]
    fn test_known_aliases() {
        let aliases = runner(Vec::new(), None).known_aliases();
        assert!(aliases.contains("sh"));
        assert!(aliases.contains("golang"));
        assert!(!aliases.contains("python"));
    }
}
