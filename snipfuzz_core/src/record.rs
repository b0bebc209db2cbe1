//! Text record of probed seeds, so a later run can skip dry run and probing.
//!
//! Layout, repeated per seed and per message:
//!
//! ```text
//! ========Seed 0========
//! Message Index-0
//! IP:192.168.1.20
//! Port:6668
//! Content:0011aabb
//!
//! Original Response
//! 0a0b
//! Probe Result:
//! PI
//! 0 0 1 1
//! PR and PS
//! (0) 0a0b
//! 100
//! (1) ff
//! 100
//! ```
//!
//! Response texts are escaped (`\\`, `\n`, `\r`) so each occupies one line.

use crate::feedback::{ResponseClass, ResponsePool};
use crate::input::{InputError, Message, RouteDefaults, Seed};
use crate::probe::ProbeResult;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use thiserror::Error;

const SEED_MARKER: &str = "========Seed";
const MESSAGE_MARKER: &str = "Message Index-";
const RESPONSE_MARKER: &str = "Original Response";
const PROBE_MARKER: &str = "Probe Result:";
const INDEX_MARKER: &str = "PI";
const POOL_MARKER: &str = "PR and PS";

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Malformed record at line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("Invalid message in record at line {line}: {source}")]
    Message {
        line: usize,
        #[source]
        source: InputError,
    },
}

/// Renders probed seeds in record format.
pub fn render_record(seeds: &[Seed]) -> String {
    let mut out = String::new();
    for (seed_index, seed) in seeds.iter().enumerate() {
        let _ = writeln!(out, "{SEED_MARKER} {seed_index}========");
        for (index, message) in seed.messages.iter().enumerate() {
            let _ = writeln!(out, "{MESSAGE_MARKER}{index}");
            for line in message.header_lines() {
                let _ = writeln!(out, "{line}");
            }
            out.push('\n');

            let _ = writeln!(out, "{RESPONSE_MARKER}");
            let response = seed.responses.get(index).map(String::as_str).unwrap_or_default();
            let _ = writeln!(out, "{}", escape(response));

            let _ = writeln!(out, "{PROBE_MARKER}");
            let _ = writeln!(out, "{INDEX_MARKER}");
            let probe = seed.probes.get(index).cloned().unwrap_or_default();
            let classes: Vec<String> = probe.index.iter().map(usize::to_string).collect();
            let _ = writeln!(out, "{}", classes.join(" "));

            let _ = writeln!(out, "{POOL_MARKER}");
            for (class_id, class) in probe.pool.classes().iter().enumerate() {
                let _ = writeln!(out, "({class_id}) {}", escape(&class.response));
                let _ = writeln!(out, "{}", class.threshold);
            }
        }
        out.push_str("\n\n");
    }
    out
}

pub fn write_record(path: &Path, seeds: &[Seed]) -> Result<(), RecordError> {
    fs::write(path, render_record(seeds))
        .map_err(|e| RecordError::Io(format!("Failed to write record {:?}: {}", path, e)))?;
    tracing::info!(path = %path.display(), seeds = seeds.len(), "Probe record written");
    Ok(())
}

pub fn read_record(path: &Path, defaults: &RouteDefaults) -> Result<Vec<Seed>, RecordError> {
    let text = fs::read_to_string(path)
        .map_err(|e| RecordError::Io(format!("Failed to read record {:?}: {}", path, e)))?;
    parse_record(&text, defaults)
}

/// Parses record text back into seeds carrying responses and probe results.
pub fn parse_record(text: &str, defaults: &RouteDefaults) -> Result<Vec<Seed>, RecordError> {
    let mut cursor = Cursor::new(text);
    let mut seeds: Vec<Seed> = Vec::new();

    while let Some(line) = cursor.next() {
        if line.starts_with(SEED_MARKER) {
            seeds.push(Seed::default());
        } else if line.starts_with(MESSAGE_MARKER) {
            let line_no = cursor.line_no();
            let Some(seed) = seeds.last_mut() else {
                return Err(cursor.error("message before any seed header"));
            };
            let (message, response, probe) = parse_message(&mut cursor, defaults)?;
            if probe.index.len() != message.content().len() {
                return Err(RecordError::Parse {
                    line: line_no,
                    reason: format!(
                        "PI has {} entries but Content has {} bytes",
                        probe.index.len(),
                        message.content().len()
                    ),
                });
            }
            seed.messages.push(message);
            seed.responses.push(response);
            seed.probes.push(probe);
        } else if !line.trim().is_empty() {
            return Err(cursor.error(format!("unexpected line {line:?}")));
        }
    }
    Ok(seeds)
}

fn parse_message(
    cursor: &mut Cursor<'_>,
    defaults: &RouteDefaults,
) -> Result<(Message, String, ProbeResult), RecordError> {
    let mut header_lines = Vec::new();
    while let Some(line) = cursor.peek() {
        if line.is_empty() || line.starts_with(RESPONSE_MARKER) {
            break;
        }
        header_lines.push(line);
        cursor.next();
    }
    let message = Message::from_lines(header_lines, defaults).map_err(|source| {
        RecordError::Message {
            line: cursor.line_no(),
            source,
        }
    })?;
    while cursor.peek().is_some_and(str::is_empty) {
        cursor.next();
    }

    cursor.expect(RESPONSE_MARKER)?;
    let response = unescape(cursor.require()?);
    cursor.expect(PROBE_MARKER)?;
    cursor.expect(INDEX_MARKER)?;
    let index = cursor
        .require()?
        .split_whitespace()
        .map(|n| n.parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| cursor.error(format!("bad PI entry: {e}")))?;

    cursor.expect(POOL_MARKER)?;
    let mut classes = Vec::new();
    while let Some(line) = cursor.peek().filter(|l| l.starts_with('(')) {
        cursor.next();
        let Some((id, text)) = line[1..].split_once(") ") else {
            return Err(cursor.error("pool entry without ') '"));
        };
        if id.parse::<usize>().ok() != Some(classes.len()) {
            return Err(cursor.error(format!("pool entry ({id}) out of order")));
        }
        let threshold = cursor
            .require()?
            .trim()
            .parse::<f64>()
            .map_err(|e| cursor.error(format!("bad threshold: {e}")))?;
        classes.push(ResponseClass {
            response: unescape(text),
            threshold,
        });
    }

    let probe = ProbeResult {
        pool: ResponsePool::from_classes(classes),
        index,
    };
    if !probe.is_consistent() {
        return Err(cursor.error("PI refers to a class missing from PR"));
    }
    Ok((message, response, probe))
}

struct Cursor<'a> {
    lines: Vec<&'a str>,
    position: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            lines: text.lines().collect(),
            position: 0,
        }
    }

    fn peek(&self) -> Option<&'a str> {
        self.lines.get(self.position).copied()
    }

    fn next(&mut self) -> Option<&'a str> {
        let line = self.peek()?;
        self.position += 1;
        Some(line)
    }

    /// One-based number of the line last returned by `next`.
    fn line_no(&self) -> usize {
        self.position.max(1)
    }

    fn require(&mut self) -> Result<&'a str, RecordError> {
        self.next()
            .ok_or_else(|| self.error("unexpected end of record"))
    }

    fn expect(&mut self, marker: &str) -> Result<(), RecordError> {
        match self.next() {
            Some(line) if line.starts_with(marker) => Ok(()),
            Some(line) => Err(self.error(format!("expected {marker:?}, found {line:?}"))),
            None => Err(self.error(format!("expected {marker:?}, found end of record"))),
        }
    }

    fn error(&self, reason: impl Into<String>) -> RecordError {
        RecordError::Parse {
            line: self.line_no(),
            reason: reason.into(),
        }
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
