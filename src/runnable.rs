use anyhow::{Context, Result};
use regex::Regex;
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// How long an `interrupt: true` example runs before it is stopped.
pub const DEFAULT_INTERRUPT_DELAY: Duration = Duration::from_secs(3);

/// A fenced code block extracted from markdown, together with its metadata.
///
/// A runnable is created by the scanner when it meets a fence with a non-empty
/// info string, e.g.
///
/// ````markdown
/// <!-- {"output": "hello"} -->
/// ```python
/// print("hello")
/// ```
/// ````
///
/// The JSON object in the comment directly above the fence is kept verbatim in
/// [`Runnable::raw_tags`] and decoded on demand through [`Runnable::tags`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Runnable {
    /// Name of the markdown document the block came from
    pub source_file: String,
    /// The fence run that opened the block; only an identical line closes it
    pub block_start: String,
    /// Lowercased language tag from the info string
    pub lang: String,
    /// 1-based line number of the opening fence
    pub line_offset: usize,
    /// Content lines between the fences
    pub lines: Vec<String>,
    /// Raw JSON captured from an adjacent tag comment
    pub raw_tags: String,
}

impl Runnable {
    pub fn new(source_file: impl Into<String>) -> Self {
        Self {
            source_file: source_file.into(),
            ..Self::default()
        }
    }

    /// Marks the start of the block at the 0-based line `lineno`.
    pub(crate) fn begin(&mut self, lineno: usize, block_start: &str, lang: &str) {
        self.lines.clear();
        self.line_offset = lineno + 1;
        self.block_start = block_start.to_string();
        self.lang = lang.to_lowercase();
    }

    /// The block source with lines joined by `\n`.
    pub fn source(&self) -> String {
        self.lines.join("\n")
    }

    /// `source:line` of the opening fence.
    pub fn location(&self) -> String {
        format!("{}:{}", self.source_file, self.line_offset)
    }

    /// Decodes the directive tags.
    ///
    /// Decoding runs on every call; the same raw tags always decode to the same
    /// [`Tags`], and malformed JSON yields empty tags plus a warning.
    pub fn tags(&self) -> Tags {
        Tags::decode(&self.raw_tags)
    }
}

impl fmt::Display for Runnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.location(), self.lang)
    }
}

/// Directives attached to a runnable through its tag comment.
///
/// | key | meaning |
/// |---|---|
/// | `output` | regex the main command's stdout must fully match |
/// | `interrupt` | `true` or a duration such as `"500ms"`; stop the example after that long |
/// | `os` | platform name or list of names the example is restricted to |
/// | `args` | extra arguments for the main command |
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tags {
    raw: Map<String, Value>,
}

impl Tags {
    pub fn decode(raw_tags: &str) -> Self {
        if raw_tags.trim().is_empty() {
            return Self::default();
        }

        match serde_json::from_str::<Map<String, Value>>(&unescape_html(raw_tags)) {
            Ok(raw) => Self { raw },
            Err(err) => {
                log::warn!("Failed to parse raw tags {:?}: {}", raw_tags, err);
                Self::default()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// The full decoded mapping, including keys this crate does not interpret.
    pub fn raw(&self) -> &Map<String, Value> {
        &self.raw
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    /// The `output` pattern source, if any.
    pub fn expected_output(&self) -> Option<&str> {
        match self.raw.get("output") {
            Some(Value::String(pattern)) => Some(pattern),
            Some(other) => {
                log::warn!("Ignoring non-string output tag: {}", other);
                None
            }
            None => None,
        }
    }

    /// How long to let the main command run before stopping it.
    ///
    /// `None` means the command runs to completion.
    pub fn interrupt(&self) -> Option<Duration> {
        match self.raw.get("interrupt")? {
            Value::Null | Value::Bool(false) => None,
            Value::String(text) => match parse_duration(text) {
                Some(delay) => Some(delay),
                None => {
                    log::debug!(
                        "Unparseable interrupt duration {:?}, using {:?}",
                        text,
                        DEFAULT_INTERRUPT_DELAY
                    );
                    Some(DEFAULT_INTERRUPT_DELAY)
                }
            },
            _ => Some(DEFAULT_INTERRUPT_DELAY),
        }
    }

    /// Platforms named by the `os` tag; empty when unrestricted.
    pub fn os(&self) -> Vec<&str> {
        match self.raw.get("os") {
            Some(Value::String(name)) => vec![name.as_str()],
            Some(Value::Array(names)) => names.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Whether the example may run on the current platform.
    pub fn is_valid_os(&self) -> bool {
        self.is_valid_os_for(std::env::consts::OS)
    }

    pub fn is_valid_os_for(&self, platform: &str) -> bool {
        if !self.raw.contains_key("os") {
            return true;
        }
        self.os().iter().any(|name| platform_matches(name, platform))
    }

    /// Extra arguments for the main command.
    pub fn args(&self) -> Vec<String> {
        match self.raw.get("args") {
            Some(Value::Array(values)) => values
                .iter()
                .filter_map(|value| match value {
                    Value::String(arg) => Some(arg.clone()),
                    other => {
                        log::warn!("Ignoring non-string argument in args tag: {}", other);
                        None
                    }
                })
                .collect(),
            Some(other) => {
                log::warn!("Ignoring args tag that is not a list: {}", other);
                Vec::new()
            }
            None => Vec::new(),
        }
    }
}

fn platform_matches(name: &str, platform: &str) -> bool {
    let name = name.trim().to_lowercase();
    name == platform || (name == "darwin" && platform == "macos")
}

/// A compiled `output` tag.
///
/// The pattern has to match the whole of stdout; a single trailing line
/// terminator is ignored so `"hi"` matches the output of `echo hi`.
#[derive(Debug, Clone)]
pub struct ExpectedOutput {
    pattern: String,
    regex: Regex,
}

impl ExpectedOutput {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(&format!(r"\A(?:{})\z", pattern))
            .with_context(|| format!("Invalid output pattern {:?}", pattern))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn is_match(&self, stdout: &str) -> bool {
        let stdout = stdout
            .strip_suffix("\r\n")
            .or_else(|| stdout.strip_suffix('\n'))
            .unwrap_or(stdout);
        self.regex.is_match(stdout)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl fmt::Display for ExpectedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.pattern)
    }
}

/// Parses Go-style durations: `300ms`, `2s`, `1m30s`, `1.5h`.
///
/// A bare `0` is accepted; anything else needs a unit.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text == "0" {
        return Some(Duration::ZERO);
    }
    if text.is_empty() || text.starts_with('-') {
        return None;
    }

    let mut total = 0f64;
    let mut rest = text.strip_prefix('+').unwrap_or(text);
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_end == 0 {
            return None;
        }
        let value: f64 = rest[..number_end].parse().ok()?;
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        rest = &rest[unit_end..];
        total += value * nanos_per_unit;
    }

    Some(Duration::from_nanos(total as u64))
}

/// Undoes the HTML escaping markdown tooling sometimes applies to comments.
fn unescape_html(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&#34;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runnable_with_tags(raw_tags: &str) -> Runnable {
        Runnable {
            raw_tags: raw_tags.to_string(),
            ..Runnable::new("README.md")
        }
    }

    #[test]
    fn test_tags_decode_is_repeatable() {
        let runnable = runnable_with_tags(r#"{"output": "hi", "args": ["-v"]}"#);
        let first = runnable.tags();
        let second = runnable.tags();
        assert_eq!(first, second);
        assert_eq!(first.expected_output(), Some("hi"));
        assert_eq!(first.args(), vec!["-v"]);
    }

    #[test]
    fn test_malformed_tags_decode_to_empty() {
        let runnable = runnable_with_tags(r#"{"output": "#);
        let tags = runnable.tags();
        assert!(tags.is_empty());
        assert_eq!(tags, runnable.tags());
        assert_eq!(tags.interrupt(), None);
        assert!(tags.args().is_empty());
    }

    #[test]
    fn test_non_object_tags_decode_to_empty() {
        assert!(Tags::decode("[1, 2]").is_empty());
        assert!(Tags::decode("").is_empty());
    }

    #[test]
    fn test_html_escaped_tags() {
        let tags = Tags::decode(r#"{&quot;output&quot;: &quot;a &amp; b&quot;}"#);
        assert_eq!(tags.expected_output(), Some("a & b"));
    }

    #[test]
    fn test_interrupt_values() {
        assert_eq!(
            Tags::decode(r#"{"interrupt": true}"#).interrupt(),
            Some(DEFAULT_INTERRUPT_DELAY)
        );
        assert_eq!(Tags::decode(r#"{"interrupt": false}"#).interrupt(), None);
        assert_eq!(
            Tags::decode(r#"{"interrupt": "250ms"}"#).interrupt(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(
            Tags::decode(r#"{"interrupt": "soon"}"#).interrupt(),
            Some(DEFAULT_INTERRUPT_DELAY)
        );
        assert_eq!(Tags::decode(r#"{"other": 1}"#).interrupt(), None);
    }

    #[test]
    fn test_os_constraint() {
        let single = Tags::decode(r#"{"os": "linux"}"#);
        assert!(single.is_valid_os_for("linux"));
        assert!(!single.is_valid_os_for("windows"));

        let several = Tags::decode(r#"{"os": ["darwin", "freebsd"]}"#);
        assert!(several.is_valid_os_for("macos"));
        assert!(several.is_valid_os_for("freebsd"));
        assert!(!several.is_valid_os_for("linux"));

        assert!(Tags::default().is_valid_os_for("windows"));
        assert!(!Tags::decode(r#"{"os": 7}"#).is_valid_os_for("linux"));
    }

    #[test]
    fn test_args_skips_non_strings() {
        let tags = Tags::decode(r#"{"args": ["a", 1, "b"]}"#);
        assert_eq!(tags.args(), vec!["a", "b"]);
        assert!(Tags::decode(r#"{"args": "a"}"#).args().is_empty());
    }

    #[test]
    fn test_expected_output_matches_whole_stdout() {
        let expected = ExpectedOutput::new("hi").unwrap();
        assert!(expected.is_match("hi\n"));
        assert!(expected.is_match("hi"));
        assert!(!expected.is_match("hi there\n"));
        assert!(!expected.is_match("oh hi\n"));

        let multiline = ExpectedOutput::new(r"(?s)Hello.*").unwrap();
        assert!(multiline.is_match("Hello\nWorld\n"));
    }

    #[test]
    fn test_invalid_output_pattern() {
        let err = ExpectedOutput::new("(unclosed").unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid output pattern"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("3s"), Some(Duration::from_secs(3)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("1m30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("0"), Some(Duration::ZERO));
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("-1s"), None);
        assert_eq!(parse_duration("2 weeks"), None);
    }

    #[test]
    fn test_begin_records_fence() {
        let mut runnable = Runnable::new("doc.md");
        runnable.lines.push("stale".to_string());
        runnable.begin(4, "```", "Python");
        assert_eq!(runnable.line_offset, 5);
        assert_eq!(runnable.lang, "python");
        assert_eq!(runnable.block_start, "```");
        assert!(runnable.lines.is_empty());
        assert_eq!(runnable.to_string(), "doc.md:5 (python)");
    }
}
