use serde::Serialize;
use std::collections::BTreeMap;

/// Resolves the tag of a fence to a known language.
///
/// The runner only needs this one question answered, so tests and embedders
/// can supply their own table.
pub trait LanguageLookup: Send + Sync {
    /// Returns `None` when the tag names no known language.
    fn lookup(&self, tag: &str) -> Option<LanguageDefinition>;
}

/// A language and the fence tags that select it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LanguageDefinition {
    /// Canonical lowercase name, also the key of the frob registry
    pub name: String,
    /// Every tag accepted for this language, the name included
    pub aliases: Vec<String>,
}

impl LanguageDefinition {
    pub fn new<S: AsRef<str>>(name: &str, aliases: impl IntoIterator<Item = S>) -> Self {
        let name = name.trim().to_lowercase();
        let mut all = vec![name.clone()];
        for alias in aliases {
            let alias = alias.as_ref().trim().to_lowercase();
            if !alias.is_empty() && !all.contains(&alias) {
                all.push(alias);
            }
        }
        Self { name, aliases: all }
    }

    pub fn matches(&self, tag: &str) -> bool {
        self.aliases.iter().any(|alias| alias == tag)
    }
}

/// Canonical names and fence aliases, based on highlight.js.
///
/// `bash`, `sh`, `zsh` and `shell` are kept apart so each can have its own
/// interpreter.
const BUILTIN_LANGUAGES: &[(&str, &[&str])] = &[
    ("awk", &["mawk", "nawk", "gawk"]),
    ("bash", &[]),
    ("c", &["h"]),
    ("clojure", &["clj"]),
    ("coffeescript", &["coffee", "cson", "iced"]),
    ("cpp", &["hpp", "cc", "hh", "c++", "h++", "cxx", "hxx"]),
    ("crystal", &["cr"]),
    ("csharp", &["cs"]),
    ("d", &[]),
    ("dart", &[]),
    ("elixir", &["ex", "exs"]),
    ("erlang", &["erl"]),
    ("fsharp", &["fs", "fsx", "fsi", "fsscript"]),
    ("go", &["golang"]),
    ("groovy", &[]),
    ("haskell", &["hs"]),
    ("java", &[]),
    ("javascript", &["js", "jsx", "node"]),
    ("json", &["jsonc", "json5"]),
    ("julia", &["jl"]),
    ("kotlin", &["kt"]),
    ("lua", &["pluto"]),
    ("nim", &["nimrod"]),
    ("ocaml", &["ml"]),
    ("perl", &["pl", "pm"]),
    ("php", &[]),
    ("powershell", &["ps", "ps1", "pwsh"]),
    ("python", &["py", "gyp", "python3"]),
    ("r", &[]),
    ("ruby", &["rb", "gemspec", "podspec", "thor", "irb"]),
    ("rust", &["rs"]),
    ("scala", &[]),
    ("sh", &[]),
    ("shell", &["shell-script"]),
    ("swift", &[]),
    ("tcl", &["tk"]),
    ("typescript", &["ts", "tsx", "mts", "cts"]),
    ("zig", &[]),
    ("zsh", &[]),
];

/// The built-in language table plus whatever the configuration adds.
#[derive(Debug, Clone, Default)]
pub struct Languages {
    definitions: BTreeMap<String, LanguageDefinition>,
}

impl Languages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut languages = Self::new();
        for (name, aliases) in BUILTIN_LANGUAGES {
            languages.extend(name, aliases.iter().copied());
        }
        languages
    }

    /// Adds a language, or more aliases for an existing one.
    pub fn extend<S: AsRef<str>>(&mut self, name: &str, aliases: impl IntoIterator<Item = S>) {
        let key = name.trim().to_lowercase();
        let mut merged = self
            .definitions
            .get(&key)
            .map(|existing| existing.aliases.clone())
            .unwrap_or_default();
        merged.extend(aliases.into_iter().map(|alias| alias.as_ref().to_string()));
        self.definitions
            .insert(key.clone(), LanguageDefinition::new(&key, merged));
    }

    pub fn iter(&self) -> impl Iterator<Item = &LanguageDefinition> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// The whole table as a pretty-printed JSON array, ordered by name.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let definitions: Vec<&LanguageDefinition> = self.iter().collect();
        serde_json::to_string_pretty(&definitions)
    }
}

impl LanguageLookup for Languages {
    fn lookup(&self, tag: &str) -> Option<LanguageDefinition> {
        let tag = tag.trim().to_lowercase();
        if tag.is_empty() {
            return None;
        }
        self.definitions
            .get(&tag)
            .or_else(|| self.definitions.values().find(|def| def.matches(&tag)))
            .cloned()
    }
}
