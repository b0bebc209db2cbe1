use crate::probe::ProbeResult;
use crate::snippet::SnippetMap;
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// Header holding the mutable payload of a message.
pub const CONTENT_HEADER: &str = "Content";
/// Line marker separating messages in a captured session file.
pub const MESSAGE_SEPARATOR: &str = "========";

const DEFAULT_SESSION_CMD: u32 = 13;
const DEFAULT_SESSION_VERSION: &str = "3.4";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InputError {
    #[error("message has neither IP/Port nor DevID/LocalKey routing headers")]
    NoRoute,
    #[error("invalid value for header '{header}': {value:?}")]
    InvalidHeader { header: String, value: String },
    #[error("session contains no messages")]
    EmptySession,
    #[error("message index {0} out of range")]
    MessageOutOfRange(usize),
}

/// Values applied when a vendor-session message omits optional headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDefaults {
    pub session_cmd: u32,
    pub session_version: String,
}

impl Default for RouteDefaults {
    fn default() -> Self {
        Self {
            session_cmd: DEFAULT_SESSION_CMD,
            session_version: DEFAULT_SESSION_VERSION.to_string(),
        }
    }
}

/// Identity of a reusable vendor session: (id, address, key, protocol version).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceFingerprint {
    pub dev_id: String,
    pub address: String,
    pub local_key: String,
    pub version: String,
}

impl fmt::Display for DeviceFingerprint {
    // The key is deliberately left out of log output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} v{}", self.dev_id, self.address, self.version)
    }
}

/// How a message reaches the device, decided once when the message is parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Hex `Content` sent over a fresh TCP connection.
    RawSocket { ip: String, port: u16 },
    /// `Content` sent as a command payload through the vendor session.
    VendorSession {
        fingerprint: DeviceFingerprint,
        cmd: u32,
    },
}

/// One protocol message: ordered headers plus the fuzzed `Content` bytes.
///
/// Header order is preserved exactly as captured so that records and crash
/// files reproduce the original layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    headers: Vec<(String, String)>,
    content: Vec<u8>,
    content_slot: usize,
    route: Route,
}

impl Message {
    /// Builds a message from ordered `(name, value)` pairs and resolves its route.
    pub fn from_headers<I>(pairs: I, defaults: &RouteDefaults) -> Result<Self, InputError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut headers = Vec::new();
        let mut content = Vec::new();
        let mut content_slot = None;
        for (name, value) in pairs {
            if name == CONTENT_HEADER {
                content = value.into_bytes();
                content_slot = Some(headers.len());
            } else {
                headers.push((name, value));
            }
        }
        let content_slot = content_slot.unwrap_or(headers.len());
        let route = resolve_route(&headers, defaults)?;
        Ok(Self {
            headers,
            content,
            content_slot,
            route,
        })
    }

    /// Parses `name:value` lines; lines without a colon are ignored.
    pub fn from_lines<'a, I>(lines: I, defaults: &RouteDefaults) -> Result<Self, InputError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        Self::from_headers(lines.into_iter().filter_map(split_header_line), defaults)
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn content_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }

    /// Returns a copy of this message carrying `content` instead of the current payload.
    pub fn with_content(&self, content: Vec<u8>) -> Self {
        Self {
            content,
            ..self.clone()
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// `name:value` lines in capture order, `Content` included at its original position.
    pub fn header_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.headers.len() + 1);
        for (position, (name, value)) in self.headers.iter().enumerate() {
            if position == self.content_slot {
                lines.push(format!("{CONTENT_HEADER}:{}", self.content_text()));
            }
            lines.push(format!("{name}:{value}"));
        }
        if self.content_slot >= self.headers.len() {
            lines.push(format!("{CONTENT_HEADER}:{}", self.content_text()));
        }
        lines
    }

    /// Same layout as `header_lines`, newline-terminated, with `Content` written byte for byte.
    pub fn header_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (position, (name, value)) in self.headers.iter().enumerate() {
            if position == self.content_slot {
                self.push_content_line(&mut out);
            }
            out.extend_from_slice(format!("{name}:{value}\n").as_bytes());
        }
        if self.content_slot >= self.headers.len() {
            self.push_content_line(&mut out);
        }
        out
    }

    fn push_content_line(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(CONTENT_HEADER.as_bytes());
        out.push(b':');
        out.extend_from_slice(&self.content);
        out.push(b'\n');
    }
}

fn split_header_line(line: &str) -> Option<(String, String)> {
    let (name, value) = line.split_once(':')?;
    Some((name.trim().to_string(), value.trim().to_string()))
}

fn lookup<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

fn resolve_route(
    headers: &[(String, String)],
    defaults: &RouteDefaults,
) -> Result<Route, InputError> {
    if let (Some(dev_id), Some(local_key)) = (lookup(headers, "DevID"), lookup(headers, "LocalKey"))
    {
        let address = lookup(headers, "Address")
            .or_else(|| lookup(headers, "IP"))
            .unwrap_or_default();
        let version = lookup(headers, "Version")
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.session_version.as_str());
        let cmd = match lookup(headers, "Cmd") {
            Some(raw) => parse_command(raw).ok_or_else(|| InputError::InvalidHeader {
                header: "Cmd".to_string(),
                value: raw.to_string(),
            })?,
            None => defaults.session_cmd,
        };
        return Ok(Route::VendorSession {
            fingerprint: DeviceFingerprint {
                dev_id: dev_id.to_string(),
                address: address.to_string(),
                local_key: local_key.to_string(),
                version: version.to_string(),
            },
            cmd,
        });
    }

    if let (Some(ip), Some(port)) = (lookup(headers, "IP"), lookup(headers, "Port")) {
        let port = port.parse::<u16>().map_err(|_| InputError::InvalidHeader {
            header: "Port".to_string(),
            value: port.to_string(),
        })?;
        return Ok(Route::RawSocket {
            ip: ip.to_string(),
            port,
        });
    }

    Err(InputError::NoRoute)
}

/// Accepts decimal or `0x`-prefixed hexadecimal command numbers.
fn parse_command(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex_digits) => u32::from_str_radix(hex_digits, 16).ok(),
        None => raw.parse().ok(),
    }
}

/// A multi-message protocol session under test, with everything learned about it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Seed {
    pub messages: Vec<Message>,
    /// Responses recorded by the dry run, one per message.
    pub responses: Vec<String>,
    /// Probe outcome per message index.
    pub probes: Vec<ProbeResult>,
    /// Snippets per message index, formed when the targeted pass starts.
    pub snippets: Vec<SnippetMap>,
    /// Set once the targeted mutation pass has run.
    pub mutated: bool,
}

impl Seed {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// Parses a captured session: blocks separated by `========` lines.
    ///
    /// Text before the first separator and blocks without any header line are skipped.
    pub fn parse_session(text: &str, defaults: &RouteDefaults) -> Result<Self, InputError> {
        let mut messages = Vec::new();
        let mut block: Option<Vec<&str>> = None;
        for line in text.lines() {
            if line.contains(MESSAGE_SEPARATOR) {
                if let Some(lines) = block.take() {
                    push_block(&mut messages, &lines, defaults)?;
                }
                block = Some(Vec::new());
            } else if let Some(lines) = block.as_mut() {
                if line.contains(':') {
                    lines.push(line);
                }
            }
        }
        if let Some(lines) = block {
            push_block(&mut messages, &lines, defaults)?;
        }

        if messages.is_empty() {
            return Err(InputError::EmptySession);
        }
        Ok(Self::new(messages))
    }

    /// The message list with `messages[index]` replaced; the seed itself is untouched.
    pub fn with_message(&self, index: usize, message: Message) -> Result<Vec<Message>, InputError> {
        if index >= self.messages.len() {
            return Err(InputError::MessageOutOfRange(index));
        }
        let mut messages = self.messages.clone();
        messages[index] = message;
        Ok(messages)
    }

    pub fn is_probed(&self) -> bool {
        !self.messages.is_empty() && self.probes.len() == self.messages.len()
    }

    /// Derives the snippet map of every message from its probe result.
    pub fn form_snippets(&mut self) {
        self.snippets = self.probes.iter().map(SnippetMap::form).collect();
    }

    /// Number of distinct snippets across all messages.
    pub fn snippet_count(&self) -> usize {
        self.snippets.iter().map(|s| s.ranges().len()).sum()
    }
}

fn push_block(
    messages: &mut Vec<Message>,
    lines: &[&str],
    defaults: &RouteDefaults,
) -> Result<(), InputError> {
    if lines.is_empty() {
        return Ok(());
    }
    messages.push(Message::from_lines(lines.iter().copied(), defaults)?);
    Ok(())
}
