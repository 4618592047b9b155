//! Trace entry serialization
//!
//! Turns a [`TraceEntry`] into the byte sequence an output consumes.
//! Serialization is a pure function of the entry: identical entries yield
//! byte-identical output.
//!
//! Two formats exist, selected by the configuration:
//!
//! - **Plaintext**: one record per line, single-space separated:
//!   `[<dd.mm.yyyy HH:MM:SS> ]<kind> <file>:<line> '<function>'
//!   ['<message>'] [<name>='<value>' ...]`
//!   Quoted fields double any embedded single quote. The timestamp prefix
//!   is controlled by the `timestamps` option. Backtraces are not rendered
//!   in plaintext.
//! - **XML**: one `<traceentry>` element per record with child elements
//!   for timestamp (epoch seconds), type, location, function, message,
//!   variables, and backtrace frames. The `beautifiedOutput` option inserts
//!   newlines and two-space indentation.
//!
//! Both formats admit deserializers; the store viewer and the round-trip
//! tests use them to recover timestamp, location, message, and variables.

use anyhow::{bail, ensure, Context, Result};
use chrono::{NaiveDateTime, TimeZone, Utc};

use crate::backtrace::Frame;
use crate::entry::{TraceEntry, Variable};
use crate::point::TracePointKind;

const TIMESTAMP_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

/// The configured serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serializer {
    Plaintext { timestamps: bool },
    Xml { beautified: bool },
}

impl Default for Serializer {
    fn default() -> Self {
        Serializer::Plaintext { timestamps: true }
    }
}

impl Serializer {
    /// Serialize `entry`. Pure and total.
    pub fn serialize(&self, entry: &TraceEntry) -> Vec<u8> {
        match self {
            Serializer::Plaintext { timestamps } => serialize_plaintext(entry, *timestamps),
            Serializer::Xml { beautified } => serialize_xml(entry, *beautified),
        }
    }
}

/// Fields recovered by the deserializers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeserializedEntry {
    /// `None` when the record carried no timestamp (plaintext with the
    /// prefix disabled).
    pub timestamp: Option<u64>,
    pub kind: TracePointKind,
    pub source_file: String,
    pub line: u32,
    pub function: String,
    pub message: Option<String>,
    pub variables: Vec<Variable>,
    /// Only the XML format carries backtraces.
    pub backtrace: Vec<Frame>,
}

fn serialize_plaintext(entry: &TraceEntry, timestamps: bool) -> Vec<u8> {
    let point = entry.point();
    let mut line = String::new();
    if timestamps {
        line.push_str(&format_timestamp(entry.timestamp()));
        line.push(' ');
    }
    line.push_str(point.kind().name());
    line.push(' ');
    line.push_str(point.source_file());
    line.push(':');
    line.push_str(&point.line().to_string());
    line.push(' ');
    line.push_str(&quote(point.function()));
    if let Some(message) = entry.message() {
        line.push(' ');
        line.push_str(&quote(message));
    }
    if let Some(variables) = entry.variables() {
        for variable in variables {
            line.push(' ');
            line.push_str(variable.name());
            line.push('=');
            line.push_str(&quote(variable.value()));
        }
    }
    line.push('\n');
    line.into_bytes()
}

/// Parse one plaintext record back into its fields.
pub fn deserialize_plaintext(line: &str) -> Result<DeserializedEntry> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let mut rest = line;

    // The timestamp prefix is recognizable by the dot after the two-digit
    // day; no trace point kind has one there.
    let timestamp = if rest.len() >= 19 && rest.as_bytes()[2] == b'.' && rest.is_char_boundary(19) {
        let (text, tail) = rest.split_at(19);
        let parsed = NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
            .with_context(|| format!("invalid timestamp '{}'", text))?;
        rest = tail
            .strip_prefix(' ')
            .context("missing separator after timestamp")?;
        Some(parsed.and_utc().timestamp() as u64)
    } else {
        None
    };

    let (kind_text, tail) = rest.split_once(' ').context("missing location field")?;
    let kind = TracePointKind::from_name(kind_text)
        .with_context(|| format!("unknown trace point kind '{}'", kind_text))?;
    rest = tail;

    let (location, tail) = rest.split_once(' ').context("missing function field")?;
    let (source_file, line_text) = location
        .rsplit_once(':')
        .with_context(|| format!("malformed location '{}'", location))?;
    let line_number: u32 = line_text
        .parse()
        .with_context(|| format!("invalid line number '{}'", line_text))?;
    rest = tail;

    let (function, tail) = take_quoted(rest)?;
    rest = tail;

    let message = if rest.starts_with('\'') {
        let (text, tail) = take_quoted(rest)?;
        rest = tail;
        Some(text)
    } else {
        None
    };

    let mut variables = Vec::new();
    while !rest.is_empty() {
        let (name, tail) = rest
            .split_once('=')
            .with_context(|| format!("malformed variable '{}'", rest))?;
        let (value, tail) = take_quoted(tail)?;
        variables.push(Variable::new(name, value));
        rest = tail;
    }

    Ok(DeserializedEntry {
        timestamp,
        kind,
        source_file: source_file.to_string(),
        line: line_number,
        function,
        message,
        variables,
        backtrace: Vec::new(),
    })
}

fn serialize_xml(entry: &TraceEntry, beautified: bool) -> Vec<u8> {
    let point = entry.point();
    let mut out = String::new();
    out.push_str("<traceentry>");
    newline(&mut out, beautified);

    simple_element(&mut out, 1, "timestamp", &entry.timestamp().to_string(), beautified);
    simple_element(&mut out, 1, "type", point.kind().name(), beautified);

    indent(&mut out, 1, beautified);
    out.push_str("<location>");
    newline(&mut out, beautified);
    simple_element(&mut out, 2, "file", point.source_file(), beautified);
    simple_element(&mut out, 2, "line", &point.line().to_string(), beautified);
    indent(&mut out, 1, beautified);
    out.push_str("</location>");
    newline(&mut out, beautified);

    simple_element(&mut out, 1, "function", point.function(), beautified);
    if let Some(message) = entry.message() {
        simple_element(&mut out, 1, "message", message, beautified);
    }

    if let Some(variables) = entry.variables() {
        indent(&mut out, 1, beautified);
        out.push_str("<variables>");
        newline(&mut out, beautified);
        for variable in variables {
            indent(&mut out, 2, beautified);
            out.push_str("<variable name=\"");
            out.push_str(&xml_escape(variable.name()));
            out.push_str("\">");
            out.push_str(&xml_escape(variable.value()));
            out.push_str("</variable>");
            newline(&mut out, beautified);
        }
        indent(&mut out, 1, beautified);
        out.push_str("</variables>");
        newline(&mut out, beautified);
    }

    if let Some(backtrace) = entry.backtrace() {
        indent(&mut out, 1, beautified);
        out.push_str("<backtrace>");
        newline(&mut out, beautified);
        for frame in backtrace.frames() {
            indent(&mut out, 2, beautified);
            out.push_str("<frame>");
            newline(&mut out, beautified);
            simple_element(&mut out, 3, "module", &frame.module, beautified);
            simple_element(&mut out, 3, "function", &frame.function, beautified);
            simple_element(&mut out, 3, "source", &frame.source, beautified);
            simple_element(&mut out, 3, "line", &frame.line.to_string(), beautified);
            indent(&mut out, 2, beautified);
            out.push_str("</frame>");
            newline(&mut out, beautified);
        }
        indent(&mut out, 1, beautified);
        out.push_str("</backtrace>");
        newline(&mut out, beautified);
    }

    out.push_str("</traceentry>\n");
    out.into_bytes()
}

/// Parse one `<traceentry>` element back into its fields.
pub fn deserialize_xml(text: &str) -> Result<DeserializedEntry> {
    let doc = roxmltree::Document::parse(text).context("malformed trace entry markup")?;
    let root = doc.root_element();
    ensure!(
        root.tag_name().name() == "traceentry",
        "unexpected root element '{}'",
        root.tag_name().name()
    );

    let mut timestamp = None;
    let mut kind = None;
    let mut source_file = None;
    let mut line = None;
    let mut function = None;
    let mut message = None;
    let mut variables = Vec::new();
    let mut backtrace = Vec::new();

    for child in root.children().filter(|n| n.is_element()) {
        match child.tag_name().name() {
            "timestamp" => {
                let text = element_text(&child);
                timestamp = Some(
                    text.parse::<u64>()
                        .with_context(|| format!("invalid timestamp '{}'", text))?,
                );
            }
            "type" => {
                let text = element_text(&child);
                kind = Some(
                    TracePointKind::from_name(&text)
                        .with_context(|| format!("unknown trace point kind '{}'", text))?,
                );
            }
            "location" => {
                for part in child.children().filter(|n| n.is_element()) {
                    match part.tag_name().name() {
                        "file" => source_file = Some(element_text(&part)),
                        "line" => {
                            let text = element_text(&part);
                            line = Some(
                                text.parse::<u32>()
                                    .with_context(|| format!("invalid line number '{}'", text))?,
                            );
                        }
                        other => bail!("unexpected element <{}> inside <location>", other),
                    }
                }
            }
            "function" => function = Some(element_text(&child)),
            "message" => message = Some(element_text(&child)),
            "variables" => {
                for var in child.children().filter(|n| n.is_element()) {
                    ensure!(
                        var.tag_name().name() == "variable",
                        "unexpected element <{}> inside <variables>",
                        var.tag_name().name()
                    );
                    let name = var
                        .attribute("name")
                        .context("<variable> element without name attribute")?;
                    variables.push(Variable::new(name, element_text(&var)));
                }
            }
            "backtrace" => {
                for frame_node in child.children().filter(|n| n.is_element()) {
                    ensure!(
                        frame_node.tag_name().name() == "frame",
                        "unexpected element <{}> inside <backtrace>",
                        frame_node.tag_name().name()
                    );
                    let mut frame = Frame::default();
                    for part in frame_node.children().filter(|n| n.is_element()) {
                        match part.tag_name().name() {
                            "module" => frame.module = element_text(&part),
                            "function" => frame.function = element_text(&part),
                            "source" => frame.source = element_text(&part),
                            "line" => {
                                let text = element_text(&part);
                                frame.line = text
                                    .parse()
                                    .with_context(|| format!("invalid frame line '{}'", text))?;
                            }
                            other => bail!("unexpected element <{}> inside <frame>", other),
                        }
                    }
                    backtrace.push(frame);
                }
            }
            other => bail!("unexpected element <{}> inside <traceentry>", other),
        }
    }

    Ok(DeserializedEntry {
        timestamp: Some(timestamp.context("<timestamp> element missing")?),
        kind: kind.context("<type> element missing")?,
        source_file: source_file.context("<file> element missing")?,
        line: line.context("<line> element missing")?,
        function: function.context("<function> element missing")?,
        message,
        variables,
        backtrace,
    })
}

fn format_timestamp(timestamp: u64) -> String {
    let parsed = i64::try_from(timestamp)
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
    match parsed {
        Some(datetime) => datetime.format(TIMESTAMP_FORMAT).to_string(),
        None => String::from("01.01.1970 00:00:00"),
    }
}

fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        if c == '\'' {
            out.push('\'');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// Parse a leading single-quoted field with doubled-quote escaping. Returns
/// the unescaped text and the remainder past the closing quote and one
/// separator space.
fn take_quoted(input: &str) -> Result<(String, &str)> {
    let body = input.strip_prefix('\'').context("expected quoted field")?;
    let mut out = String::new();
    let mut chars = body.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            if matches!(chars.peek(), Some((_, '\''))) {
                chars.next();
                out.push('\'');
            } else {
                let rest = &body[i + 1..];
                let rest = rest.strip_prefix(' ').unwrap_or(rest);
                return Ok((out, rest));
            }
        } else {
            out.push(c);
        }
    }
    bail!("unterminated quoted field")
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

// Unlike configuration markup, entry markup is machine-written; text is
// taken verbatim so padded values survive a round trip.
fn element_text(node: &roxmltree::Node) -> String {
    node.text().unwrap_or("").to_string()
}

fn simple_element(out: &mut String, depth: usize, tag: &str, text: &str, beautified: bool) {
    indent(out, depth, beautified);
    out.push('<');
    out.push_str(tag);
    out.push('>');
    out.push_str(&xml_escape(text));
    out.push_str("</");
    out.push_str(tag);
    out.push('>');
    newline(out, beautified);
}

fn indent(out: &mut String, depth: usize, beautified: bool) {
    if beautified {
        for _ in 0..depth {
            out.push_str("  ");
        }
    }
}

fn newline(out: &mut String, beautified: bool) {
    if beautified {
        out.push('\n');
    }
}
