use crate::frob::{Command, ConfiguredFrob, FrobRegistry};
use crate::language::Languages;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

/// Name of the per-project configuration file.
pub const CONFIG_FILE_NAME: &str = "mdrun.toml";

/// Configuration loaded from `mdrun.toml`.
///
/// Languages add fence aliases; frobs add, replace or disable execution
/// strategies. Everything is optional, an empty file yields the defaults.
///
/// # Example
///
/// ```toml
/// [languages.lua]
/// aliases = ["lua"]
///
/// [frobs.lua]
/// extension = "lua"
/// interpreter = "lua"
///
/// [frobs.rust]
/// extension = "rs"
/// file_name = "main.rs"
/// commands = [
///   { args = ["rustc", "-o", "{{NAMEBASE}}", "{{FILE}}"] },
///   { main = true, args = ["{{NAMEBASE}}"] },
/// ]
/// env = { RUST_BACKTRACE = "1" }
///
/// [frobs.ruby]
/// enabled = false
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RunnerConfig {
    /// Extra languages or aliases indexed by canonical name
    pub languages: BTreeMap<String, LanguageConfig>,
    /// Frob overrides indexed by canonical language name
    pub frobs: BTreeMap<String, FrobConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LanguageConfig {
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// A user-declared frob.
///
/// Programs, arguments and environment values support `${VAR}` expansion.
///
/// # Security
///
/// Programs are validated to prevent command injection. They cannot contain
/// shell metacharacters or use parent directory traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrobConfig {
    /// `false` removes the frob, including a built-in one
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Extension of the materialized source, without the dot
    #[serde(default)]
    pub extension: Option<String>,

    /// Shorthand for a single main command `<interpreter> -- {{FILE}}`
    #[serde(default)]
    pub interpreter: Option<String>,

    #[serde(default)]
    pub commands: Vec<CommandConfig>,

    /// Fixed file name instead of `example.<extension>`
    #[serde(default)]
    pub file_name: Option<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    #[serde(default)]
    pub main: bool,
    pub args: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn validate_program(program: &str) -> Result<()> {
    if program.is_empty() {
        anyhow::bail!("Program cannot be empty");
    }

    let dangerous_chars = [';', '|', '&', '`', '\n', '\r'];
    for ch in dangerous_chars {
        if program.contains(ch) {
            anyhow::bail!(
                "Program contains invalid character '{}': {}",
                ch.escape_default(),
                program
            );
        }
    }

    for component in Path::new(program).components() {
        if matches!(component, std::path::Component::ParentDir) {
            anyhow::bail!("Program cannot contain '..': {}", program);
        }
    }

    Ok(())
}

impl FrobConfig {
    /// Validate the configuration for security and correctness
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        match self.extension.as_deref() {
            None | Some("") => anyhow::bail!("Frob configuration must set an extension"),
            Some(ext) if ext.contains(['/', '\\']) => {
                anyhow::bail!("Extension cannot contain a path separator: {}", ext)
            }
            Some(_) => {}
        }

        if let Some(name) = &self.file_name {
            if name.is_empty() || name.contains(['/', '\\']) || name == ".." {
                anyhow::bail!("File name must be a plain file name: {:?}", name);
            }
        }

        match (&self.interpreter, self.commands.is_empty()) {
            (Some(_), false) => {
                anyhow::bail!("Frob configuration cannot set both interpreter and commands")
            }
            (None, true) => {
                anyhow::bail!("Frob configuration must set either interpreter or commands")
            }
            (Some(interpreter), true) => validate_program(interpreter)?,
            (None, false) => {
                let mains = self.commands.iter().filter(|c| c.main).count();
                if mains != 1 {
                    anyhow::bail!("Frob configuration must have exactly one main command, found {}", mains);
                }
                for command in &self.commands {
                    let program = command.args.first().map(String::as_str).unwrap_or_default();
                    validate_program(program)?;
                }
            }
        }

        Ok(())
    }

    fn expand_env(&mut self) {
        if let Some(interpreter) = self.interpreter.as_mut() {
            *interpreter = expand_env_vars(interpreter);
        }
        for command in self.commands.iter_mut() {
            for arg in command.args.iter_mut() {
                *arg = expand_env_vars(arg);
            }
        }
        for value in self.env.values_mut() {
            *value = expand_env_vars(value);
        }
    }

    fn extension(&self) -> &str {
        self.extension.as_deref().unwrap_or_default()
    }

    fn to_commands(&self) -> Vec<Command> {
        match &self.interpreter {
            Some(interpreter) => {
                vec![Command::main([interpreter.as_str(), "--", "{{FILE}}"])]
            }
            None => self
                .commands
                .iter()
                .map(|c| Command {
                    main: c.main,
                    args: c.args.clone(),
                })
                .collect(),
        }
    }
}

impl RunnerConfig {
    /// Parse configuration text, expand environment variables and validate
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let mut config: RunnerConfig = toml::from_str(text).context("Failed to parse configuration")?;

        for (name, frob) in config.frobs.iter_mut() {
            frob.expand_env();
            frob.validate()
                .with_context(|| format!("Invalid configuration for frob '{}'", name))?;
        }

        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration: {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("In {}", path.display()))
    }

    /// Finds the configuration file to use.
    ///
    /// An explicit path is returned as-is so that a missing file is reported.
    /// Otherwise `./mdrun.toml`, `$XDG_CONFIG_HOME/mdrun/config.toml` and the
    /// platform configuration directory are tried in that order.
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }

        let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(xdg) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
            candidates.push(PathBuf::from(xdg).join("mdrun").join("config.toml"));
        }
        if let Some(dirs) = directories::ProjectDirs::from("", "", "mdrun") {
            candidates.push(dirs.config_dir().join("config.toml"));
        }

        candidates.into_iter().find(|path| path.is_file())
    }

    /// Loads the located configuration, or the defaults when there is none.
    pub fn load_default(explicit: Option<&Path>) -> Result<Self> {
        match Self::locate(explicit) {
            Some(path) => {
                log::info!("Using configuration {}", path.display());
                Self::load(&path)
            }
            None => {
                log::debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Built-in languages plus configured ones.
    ///
    /// Every configured frob name is registered as a language too, so a frob
    /// for an unknown language is reachable by its own name.
    pub fn languages(&self) -> Languages {
        let mut languages = Languages::builtin();
        for (name, language) in &self.languages {
            languages.extend(name, &language.aliases);
        }
        for name in self.frobs.keys() {
            languages.extend(name, Vec::<String>::new());
        }
        languages
    }

    /// Built-in frobs with configured overrides applied.
    pub fn frobs(&self) -> FrobRegistry {
        let mut registry = FrobRegistry::with_defaults();
        for (name, frob) in &self.frobs {
            if !frob.enabled {
                log::debug!("Disabling frob {}", name);
                registry.remove(name);
                continue;
            }

            registry.insert(
                name,
                ConfiguredFrob::new(
                    frob.extension(),
                    frob.file_name.clone(),
                    frob.to_commands(),
                    frob.env.clone().into_iter().collect(),
                ),
            );
        }
        registry
    }
}

/// Substitutes `${NAME}` references from the process environment.
///
/// Substituted values are not scanned again. Unset names and a `${` with no
/// closing brace are kept as written.
fn expand_env_vars(text: &str) -> String {
    let mut expanded = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find("${") {
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else {
            break;
        };
        let name = &after[..close];
        expanded.push_str(&rest[..open]);
        match env::var(name) {
            Ok(value) => expanded.push_str(&value),
            Err(_) => {
                log::warn!("Environment variable '{}' is not set, leaving it unexpanded", name);
                expanded.push_str(&rest[open..open + close + 3]);
            }
        }
        rest = &after[close + 1..];
    }

    expanded.push_str(rest);
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::LanguageLookup;
    use crate::runnable::Runnable;
    use serial_test::serial;

    const EXAMPLE: &str = r#"
[languages.lua]
aliases = ["moon-lua"]

[frobs.lua]
extension = "lua"
interpreter = "lua"

[frobs.rust]
extension = "rs"
file_name = "main.rs"
commands = [
  { args = ["rustc", "-o", "{{NAMEBASE}}", "{{FILE}}"] },
  { main = true, args = ["{{NAMEBASE}}"] },
]
env = { RUST_BACKTRACE = "1" }

[frobs.ruby]
enabled = false
"#;

    #[test]
    fn test_parse_example() {
        let config = RunnerConfig::from_toml_str(EXAMPLE).unwrap();
        assert_eq!(config.frobs.len(), 3);
        assert!(!config.frobs["ruby"].enabled);
        assert_eq!(config.frobs["rust"].commands.len(), 2);

        let frobs = config.frobs();
        assert!(frobs.get("ruby").is_none());
        assert!(frobs.get("python").is_some());

        let block = Runnable {
            lines: vec!["fn main() {}".to_string()],
            ..Runnable::new("README.md")
        };
        let rust = frobs.get("rust").unwrap();
        assert_eq!(rust.temp_file_name(&block), "main.rs");
        assert_eq!(rust.commands(&block)[1], Command::main(["{{NAMEBASE}}"]));
        assert_eq!(
            rust.environ(&block),
            vec![("RUST_BACKTRACE".to_string(), "1".to_string())]
        );

        let lua = frobs.get("lua").unwrap();
        assert_eq!(
            lua.commands(&block),
            vec![Command::main(["lua", "--", "{{FILE}}"])]
        );
    }

    #[test]
    fn test_languages_include_configured() {
        let config = RunnerConfig::from_toml_str(EXAMPLE).unwrap();
        let languages = config.languages();
        assert_eq!(languages.lookup("moon-lua").unwrap().name, "lua");
        assert_eq!(languages.lookup("rs").unwrap().name, "rust");
    }

    #[test]
    fn test_empty_config_is_default() {
        let config = RunnerConfig::from_toml_str("").unwrap();
        assert!(config.frobs.is_empty());
        assert_eq!(config.frobs().len(), FrobRegistry::with_defaults().len());
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            ("[frobs.x]\ninterpreter = \"x\"", "extension"),
            ("[frobs.x]\nextension = \"x\"", "either interpreter or commands"),
            (
                "[frobs.x]\nextension = \"x\"\ninterpreter = \"x\"\ncommands = [{ main = true, args = [\"x\"] }]",
                "both",
            ),
            (
                "[frobs.x]\nextension = \"x\"\ncommands = [{ args = [\"x\"] }]",
                "exactly one main",
            ),
            (
                "[frobs.x]\nextension = \"x\"\ninterpreter = \"sh; rm -rf /\"",
                "invalid character",
            ),
            (
                "[frobs.x]\nextension = \"x\"\ninterpreter = \"../bin/x\"",
                "'..'",
            ),
            (
                "[frobs.x]\nextension = \"x\"\ninterpreter = \"x\"\nfile_name = \"a/b.x\"",
                "plain file name",
            ),
        ];

        for (text, expected) in cases {
            let err = RunnerConfig::from_toml_str(text).unwrap_err();
            assert!(
                format!("{:#}", err).contains(expected),
                "{:?} should fail with {:?}, got {:#}",
                text,
                expected,
                err
            );
        }
    }

    #[test]
    fn test_disabled_frob_skips_validation() {
        let config = RunnerConfig::from_toml_str("[frobs.go]\nenabled = false").unwrap();
        assert!(config.frobs().get("go").is_none());
    }

    #[test]
    #[serial]
    fn test_env_expansion_in_frobs() {
        env::set_var("MDRUN_TEST_INTERP", "/opt/lua/bin/lua");
        let config = RunnerConfig::from_toml_str(
            "[frobs.lua]\nextension = \"lua\"\ninterpreter = \"${MDRUN_TEST_INTERP}\"",
        )
        .unwrap();
        env::remove_var("MDRUN_TEST_INTERP");
        assert_eq!(
            config.frobs["lua"].interpreter.as_deref(),
            Some("/opt/lua/bin/lua")
        );
    }

    #[test]
    fn test_locate_explicit_and_missing() {
        let path = Path::new("/nonexistent/mdrun.toml");
        assert_eq!(RunnerConfig::locate(Some(path)), Some(path.to_path_buf()));
        assert!(RunnerConfig::load_default(Some(path)).is_err());
    }

    #[test]
    #[serial]
    fn test_load_from_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), EXAMPLE).unwrap();

        let previous = env::current_dir().unwrap();
        env::set_current_dir(dir.path()).unwrap();
        let config = RunnerConfig::load_default(None);
        env::set_current_dir(previous).unwrap();

        assert_eq!(config.unwrap().frobs.len(), 3);
    }

    #[test]
    #[serial]
    fn test_env_expansion_in_commands_and_env() {
        env::set_var("MDRUN_TEST_PREFIX", "/opt/rust");
        let config = RunnerConfig::from_toml_str(
            r#"
[frobs.rust]
extension = "rs"
commands = [{ main = true, args = ["rustc", "--sysroot=${MDRUN_TEST_PREFIX}", "{{FILE}}"] }]
env = { RUSTUP_HOME = "${MDRUN_TEST_PREFIX}/rustup" }
"#,
        )
        .unwrap();
        env::remove_var("MDRUN_TEST_PREFIX");

        let rust = &config.frobs["rust"];
        assert_eq!(rust.commands[0].args[1], "--sysroot=/opt/rust");
        assert_eq!(rust.env["RUSTUP_HOME"], "/opt/rust/rustup");
    }

    #[test]
    #[serial]
    fn test_unset_and_unclosed_references_stay_literal() {
        env::remove_var("MDRUN_TEST_UNSET");
        let config = RunnerConfig::from_toml_str(
            r#"
[frobs.lua]
extension = "lua"
commands = [{ main = true, args = ["lua", "${MDRUN_TEST_UNSET}", "${HOME", "{{FILE}}"] }]
env = { LUA_PATH = "${MDRUN_TEST_UNSET}/?.lua" }
"#,
        )
        .unwrap();

        let lua = &config.frobs["lua"];
        assert_eq!(lua.commands[0].args[1], "${MDRUN_TEST_UNSET}");
        assert_eq!(lua.commands[0].args[2], "${HOME");
        assert_eq!(lua.env["LUA_PATH"], "${MDRUN_TEST_UNSET}/?.lua");
    }
}
