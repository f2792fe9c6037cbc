use crate::runnable::Runnable;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Matches a whole tag comment and captures its JSON object.
fn raw_tags_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\A<!--\s*(\{.+\})\s*-->\z").expect("valid tag regex"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Text,
    CodeBlock,
    Runnable,
    Comment,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Text => "text",
            State::CodeBlock => "code-block",
            State::Runnable => "runnable",
            State::Comment => "comment",
        };
        f.write_str(name)
    }
}

/// An opening or closing fence line, already trimmed.
#[derive(Debug, PartialEq, Eq)]
struct Fence<'a> {
    marker: &'a str,
    info: &'a str,
}

impl<'a> Fence<'a> {
    fn parse(trimmed: &'a str) -> Option<Self> {
        let fence_char = trimmed.chars().next()?;
        if fence_char != '`' && fence_char != '~' {
            return None;
        }

        let run = trimmed
            .find(|c: char| c != fence_char)
            .unwrap_or(trimmed.len());
        if run < 3 {
            return None;
        }

        Some(Self {
            marker: &trimmed[..run],
            info: trimmed[run..].trim(),
        })
    }

    /// First token of the info string: `python` for "python title=x" or "python,ignore".
    fn language(&self) -> &'a str {
        self.info
            .split(|c: char| c.is_whitespace() || c == ',')
            .next()
            .unwrap_or_default()
    }
}

/// Line-oriented markdown scanner that isolates runnable code blocks.
///
/// The scanner is a small state machine over four states: plain text,
/// non-runnable code blocks (fences without an info string), runnable blocks
/// (fences with one) and multi-line HTML comments. A block only closes on a
/// line identical to its opening fence run, so examples may contain shorter or
/// different fences of their own.
///
/// A tag comment is attached to a runnable only when nothing but blank lines
/// separates the two:
///
/// ````markdown
/// <!-- {"output": "hi"} -->
///
/// ```bash
/// echo hi
/// ```
/// ````
pub struct Scanner {
    source_name: String,
    state: State,
    current: Runnable,
    code_block_start: String,
    text_size: usize,
    last_comment: String,
    lineno: usize,
}

impl Scanner {
    pub fn new(source_name: impl Into<String>) -> Self {
        let source_name = source_name.into();
        Self {
            current: Runnable::new(source_name.clone()),
            source_name,
            state: State::Text,
            code_block_start: String::new(),
            text_size: 0,
            last_comment: String::new(),
            lineno: 0,
        }
    }

    /// Scans `source` to completion and returns its runnables in document order.
    ///
    /// A runnable still open at the end of input is returned with everything
    /// accumulated so far.
    pub fn scan(mut self, source: &str) -> Vec<Runnable> {
        let mut runnables = Vec::new();

        for (lineno, line) in source.lines().enumerate() {
            self.lineno = lineno;
            if let Some(runnable) = self.handle_line(line) {
                runnables.push(runnable);
                log::debug!(
                    "Leaving runnable code block ({} found so far)",
                    runnables.len()
                );
            }
            log::trace!(
                "Scanned {}:{} {:?} state={}",
                self.source_name,
                lineno + 1,
                line.trim(),
                self.state
            );
        }

        if self.state == State::Runnable {
            log::debug!(
                "Unterminated runnable at {}, keeping {} line(s)",
                self.current.location(),
                self.current.lines.len()
            );
            runnables.push(self.current);
        }

        runnables
    }

    fn handle_line(&mut self, line: &str) -> Option<Runnable> {
        let trimmed = line.trim();

        if let Some(fence) = Fence::parse(trimmed) {
            return self.handle_fence(line, trimmed, fence);
        }

        match self.state {
            State::Text if trimmed.starts_with("<!--") => {
                self.set_state(State::Comment, line);
                if let Some(tail) = comment_tail(trimmed) {
                    self.close_comment(tail);
                }
            }
            State::Text => self.text_size += trimmed.len(),
            State::Comment => {
                self.last_comment.push('\n');
                self.last_comment.push_str(line);
                if let Some(tail) = comment_tail(trimmed) {
                    self.close_comment(tail);
                }
            }
            State::Runnable => self.current.lines.push(line.to_string()),
            State::CodeBlock => {}
        }

        None
    }

    fn handle_fence(&mut self, line: &str, trimmed: &str, fence: Fence<'_>) -> Option<Runnable> {
        match self.state {
            State::CodeBlock => {
                if trimmed == self.code_block_start {
                    return self.set_state(State::Text, line);
                }
                log::debug!("Assuming nested code block at line {}", self.lineno + 1);
                None
            }
            State::Runnable => {
                if trimmed == self.current.block_start {
                    return self.set_state(State::Text, line);
                }
                log::debug!(
                    "Mismatched closing fence {:?} inside {} block opened by {:?}",
                    trimmed,
                    self.current.lang,
                    self.current.block_start
                );
                self.current.lines.push(line.to_string());
                None
            }
            State::Comment => {
                self.last_comment.push('\n');
                self.last_comment.push_str(line);
                if let Some(tail) = comment_tail(trimmed) {
                    self.close_comment(tail);
                }
                None
            }
            State::Text if fence.info.is_empty() => {
                self.code_block_start = fence.marker.to_string();
                self.set_state(State::CodeBlock, line)
            }
            State::Text => {
                self.start_runnable(fence.marker, fence.language());
                None
            }
        }
    }

    /// Ends a comment; `tail` is whatever followed `-->` on the closing line.
    fn close_comment(&mut self, tail: &str) {
        self.set_state(State::Text, "");
        self.text_size = tail.trim().len();
    }

    fn start_runnable(&mut self, marker: &str, lang: &str) {
        self.set_state(State::Runnable, "");
        self.current.begin(self.lineno, marker, lang);
    }

    fn set_state(&mut self, next: State, line: &str) -> Option<Runnable> {
        let previous = self.state;
        self.state = next;
        log::trace!("Setting state {} -> {}", previous, next);

        match (previous, next) {
            (State::Text, State::CodeBlock) => {
                log::debug!("Starting non-runnable code block at line {}", self.lineno + 1);
                self.text_size = 0;
                self.last_comment.clear();
                None
            }
            (State::CodeBlock, State::Text) => {
                log::debug!("Leaving non-runnable code block");
                self.code_block_start.clear();
                None
            }
            (State::Text, State::Comment) => {
                self.text_size = 0;
                self.last_comment = line.trim().to_string();
                None
            }
            (State::Comment, State::Text) => None,
            (State::Text, State::Runnable) => {
                log::debug!(
                    "Starting new runnable at line {} (text_size={}, last_comment={:?})",
                    self.lineno + 1,
                    self.text_size,
                    self.last_comment
                );
                if self.text_size == 0 {
                    if let Some(raw_tags) = raw_tags_re()
                        .captures(self.last_comment.trim())
                        .and_then(|captures| captures.get(1))
                    {
                        log::debug!("Setting raw tags {}", raw_tags.as_str());
                        self.current.raw_tags = raw_tags.as_str().to_string();
                    }
                }
                self.last_comment.clear();
                None
            }
            (State::Runnable, State::Text) => {
                let fresh = Runnable::new(self.source_name.clone());
                self.text_size = 0;
                self.last_comment.clear();
                Some(std::mem::replace(&mut self.current, fresh))
            }
            (from, to) => {
                log::debug!("Ignoring transition {} -> {}", from, to);
                self.state = from;
                None
            }
        }
    }
}

/// Text following `-->` when `trimmed` closes a comment.
fn comment_tail(trimmed: &str) -> Option<&str> {
    trimmed.find("-->").map(|end| &trimmed[end + 3..])
}

/// Scans a whole markdown document for runnable blocks.
///
/// # Example
///
/// ```
/// let markdown = "# Demo\n\n```sh\necho hi\n```\n\n```\nplain\n```\n";
/// let runnables = mdrun::find_runnables("demo.md", markdown);
/// assert_eq!(runnables.len(), 1);
/// assert_eq!(runnables[0].lang, "sh");
/// assert_eq!(runnables[0].lines, vec!["echo hi"]);
/// ```
pub fn find_runnables(source_name: &str, source: &str) -> Vec<Runnable> {
    Scanner::new(source_name).scan(source)
}
