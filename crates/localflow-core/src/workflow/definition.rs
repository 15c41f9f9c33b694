//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Compiles the Localflow text syntax into the ordered step plan the
//! executor walks:
//!
//! ```text
//! # charge, wait an hour, then confirm
//! workflow order_flow {
//!     step charge_card;
//!     wait 1h
//!     step send_email;
//! }
//! ```
//!
//! Steps keep their textual order, waits included. Durations are one or more
//! `<number><unit>` segments with units `d`, `h`, `m`, `s` (`1h30m`).

use std::path::{Path, PathBuf};

use chrono::Utc;
use localflow_types::workflow::{Step, WorkflowDefinition};

/// File extension for workflow definition files.
pub const DEFINITION_EXTENSION: &str = "flow";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while compiling workflow definitions.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    /// Syntax error in the definition text.
    #[error("parse error on line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token<'a> {
    Word(&'a str),
    OpenBrace,
    CloseBrace,
    Semicolon,
}

#[derive(Debug, Clone)]
struct Spanned<'a> {
    token: Token<'a>,
    line: usize,
}

fn tokenize(source: &str) -> Vec<Spanned<'_>> {
    let mut tokens = Vec::new();
    for (idx, raw_line) in source.lines().enumerate() {
        let line = idx + 1;
        let code = strip_comment(raw_line);

        let mut start: Option<usize> = None;
        for (pos, ch) in code.char_indices() {
            let symbol = match ch {
                '{' => Some(Token::OpenBrace),
                '}' => Some(Token::CloseBrace),
                ';' => Some(Token::Semicolon),
                _ => None,
            };
            if symbol.is_some() || ch.is_whitespace() {
                if let Some(s) = start.take() {
                    tokens.push(Spanned {
                        token: Token::Word(&code[s..pos]),
                        line,
                    });
                }
                if let Some(token) = symbol {
                    tokens.push(Spanned { token, line });
                }
            } else if start.is_none() {
                start = Some(pos);
            }
        }
        if let Some(s) = start {
            tokens.push(Spanned {
                token: Token::Word(&code[s..]),
                line,
            });
        }
    }
    tokens
}

fn strip_comment(line: &str) -> &str {
    let cut = [line.find('#'), line.find("//")]
        .into_iter()
        .flatten()
        .min();
    match cut {
        Some(idx) => &line[..idx],
        None => line,
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

struct Parser<'a> {
    tokens: Vec<Spanned<'a>>,
    pos: usize,
    last_line: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: Vec<Spanned<'a>>) -> Self {
        let last_line = tokens.last().map_or(1, |t| t.line);
        Self {
            tokens,
            pos: 0,
            last_line,
        }
    }

    fn peek(&self) -> Option<&Spanned<'a>> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Spanned<'a>> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, line: usize, message: impl Into<String>) -> DefinitionError {
        DefinitionError::Parse {
            line,
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: Token<'a>, what: &str) -> Result<usize, DefinitionError> {
        match self.next() {
            Some(t) if t.token == expected => Ok(t.line),
            Some(t) => Err(self.error(t.line, format!("expected {what}, found {}", describe(&t.token)))),
            None => Err(self.error(self.last_line, format!("expected {what}, found end of input"))),
        }
    }

    fn word(&mut self, what: &str) -> Result<(&'a str, usize), DefinitionError> {
        match self.next() {
            Some(Spanned {
                token: Token::Word(w),
                line,
            }) => Ok((w, line)),
            Some(t) => Err(self.error(t.line, format!("expected {what}, found {}", describe(&t.token)))),
            None => Err(self.error(self.last_line, format!("expected {what}, found end of input"))),
        }
    }

    fn workflow(&mut self) -> Result<(String, Vec<Step>), DefinitionError> {
        let (keyword, line) = self.word("'workflow'")?;
        if keyword != "workflow" {
            return Err(self.error(line, format!("expected 'workflow', found '{keyword}'")));
        }
        let (name, line) = self.word("workflow name")?;
        if !is_identifier(name, true) {
            return Err(self.error(line, format!("invalid workflow name '{name}'")));
        }
        self.expect(Token::OpenBrace, "'{'")?;

        let mut steps = Vec::new();
        loop {
            let Some(next) = self.next() else {
                return Err(self.error(self.last_line, "unterminated workflow body, expected '}'"));
            };
            match next.token {
                Token::CloseBrace => break,
                Token::Word("step") => {
                    let (activity, line) = self.word("activity name")?;
                    if !is_identifier(activity, false) {
                        return Err(self.error(line, format!("invalid activity name '{activity}'")));
                    }
                    self.expect(Token::Semicolon, "';' after step")?;
                    steps.push(Step::activity(activity));
                }
                Token::Word("wait") => {
                    let (raw, line) = self.word("wait duration")?;
                    let seconds = parse_duration(raw).map_err(|message| self.error(line, message))?;
                    if matches!(self.peek().map(|t| &t.token), Some(Token::Semicolon)) {
                        self.pos += 1;
                    }
                    steps.push(Step::wait(seconds));
                }
                other => {
                    return Err(self.error(
                        next.line,
                        format!("expected 'step', 'wait' or '}}', found {}", describe(&other)),
                    ));
                }
            }
        }

        if let Some(extra) = self.peek() {
            return Err(self.error(
                extra.line,
                format!("unexpected {} after workflow body", describe(&extra.token)),
            ));
        }
        Ok((name.to_string(), steps))
    }
}

fn describe(token: &Token<'_>) -> String {
    match token {
        Token::Word(w) => format!("'{w}'"),
        Token::OpenBrace => "'{'".to_string(),
        Token::CloseBrace => "'}'".to_string(),
        Token::Semicolon => "';'".to_string(),
    }
}

fn is_identifier(s: &str, allow_hyphen: bool) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || (allow_hyphen && c == '-'))
}

/// Parse a duration such as `45s`, `10m`, `1h30m` or `2d` into seconds.
pub fn parse_duration(raw: &str) -> Result<i64, String> {
    let mut total: i64 = 0;
    let mut digits = String::new();
    let mut segments = 0;

    for ch in raw.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let unit: i64 = match ch {
            'd' => 86_400,
            'h' => 3_600,
            'm' => 60,
            's' => 1,
            _ => return Err(format!("invalid duration '{raw}': unknown unit '{ch}'")),
        };
        if digits.is_empty() {
            return Err(format!("invalid duration '{raw}': unit '{ch}' without a number"));
        }
        let value: i64 = digits
            .parse()
            .map_err(|_| format!("invalid duration '{raw}': number too large"))?;
        total = value
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(|| format!("invalid duration '{raw}': too large"))?;
        digits.clear();
        segments += 1;
    }

    if !digits.is_empty() {
        return Err(format!("invalid duration '{raw}': missing unit (use d, h, m or s)"));
    }
    if segments == 0 {
        return Err(format!("invalid duration '{raw}'"));
    }
    Ok(total)
}

/// Compile definition text into a validated `WorkflowDefinition`.
pub fn parse_workflow(source: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let mut parser = Parser::new(tokenize(source));
    let (name, steps) = parser.workflow()?;
    let def = WorkflowDefinition {
        name,
        steps,
        source: Some(source.to_string()),
        registered_at: Utc::now(),
    };
    validate_definition(&def)?;
    Ok(def)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumerics, underscores, hyphens
/// - At least one step exists
/// - Activity names are identifiers
/// - Wait durations are non-negative
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.name.is_empty() {
        return Err(DefinitionError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if !is_identifier(&def.name, true) {
        return Err(DefinitionError::ValidationError(format!(
            "workflow name '{}' contains invalid characters (only alphanumerics, underscores and hyphens allowed)",
            def.name
        )));
    }

    if def.steps.is_empty() {
        return Err(DefinitionError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    for (index, step) in def.steps.iter().enumerate() {
        match step {
            Step::Activity { name } if !is_identifier(name, false) => {
                return Err(DefinitionError::ValidationError(format!(
                    "step {index}: invalid activity name '{name}'"
                )));
            }
            Step::Wait { seconds } if *seconds < 0 => {
                return Err(DefinitionError::ValidationError(format!(
                    "step {index}: wait duration must not be negative ({seconds}s)"
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// Load and compile a workflow definition file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow(&content)
}

/// Discover all `.flow` files directly under `base_dir`.
///
/// Files that fail to compile are logged and skipped.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    for entry in std::fs::read_dir(base_dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == DEFINITION_EXTENSION) {
            match load_workflow_file(&path) {
                Ok(def) => results.push((path, def)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping invalid workflow file");
                }
            }
        }
    }
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
