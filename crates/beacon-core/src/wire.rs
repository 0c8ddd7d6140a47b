//! Discovery wire format — textual markup messages.
//!
//! Inbound (client → server):
//!   `<query/>`                      — list every source I may see
//!   `<source>…</source>`            — announce one source
//!
//! Outbound (server → client), each terminated by a single NUL byte:
//!   `<sources><source>…</source>…</sources>`
//!   `<add_source><source>…</source></add_source>`
//!   `<remove_source><source>…</source></remove_source>`
//!
//! Encoding is deterministic and never pretty-printed; receivers may scan
//! for substrings instead of parsing. Empty elements are self-closed.

use std::fmt::Write as _;
use std::net::Ipv4Addr;

use crate::markup::{self, escape, Element};
use crate::policy::parse_ipv4;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Default TCP port of the discovery server.
pub const DISCOVERY_PORT: u16 = 5959;

/// Default TCP port of the filtering relay.
pub const RELAY_PORT: u16 = 5958;

/// Port assumed when an announcement omits one.
pub const DEFAULT_SOURCE_PORT: u16 = 5961;

/// Group assumed when an announcement lists none.
pub const DEFAULT_GROUP: &str = "public";

/// Outbound frame terminator.
pub const FRAME_TERMINATOR: u8 = 0;

/// Inbound bytes buffered without a complete frame before they are dropped.
pub const MAX_INBOUND_FRAME: usize = 64 * 1024;

const QUERY_MARKERS: [&[u8]; 3] = [b"<query/>", b"<query />", b"<query></query>"];
const SOURCE_OPEN: &[u8] = b"<source>";
const SOURCE_CLOSE: &[u8] = b"</source>";
const SOURCES_OPEN: &[u8] = b"<sources>";
const SOURCES_CLOSE: &[u8] = b"</sources>";
const SOURCES_EMPTY: &[u8] = b"<sources/>";

// ── Messages ──────────────────────────────────────────────────────────────────

/// A source as announced by a sender.
///
/// `address` is `None` when omitted; `Some(0.0.0.0)` is kept as sent. The
/// registry resolves both to the announcing connection's address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub name: String,
    pub address: Option<Ipv4Addr>,
    pub port: u16,
    pub groups: Vec<String>,
}

/// A fully resolved source descriptor as sent to watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub name: String,
    pub metadata: String,
    pub address: Ipv4Addr,
    pub port: u16,
    pub groups: Vec<String>,
}

/// One inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Query,
    Announce(Announcement),
}

/// Result of scanning an inbound buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scanned {
    /// Not enough bytes yet.
    Incomplete,
    /// Drop this many bytes; they carry nothing.
    Skip(usize),
    /// A frame occupying this many bytes from the start of the buffer.
    Frame(usize, Frame),
    /// This many bytes could not be understood.
    Malformed(usize, WireError),
}

// ── Inbound ───────────────────────────────────────────────────────────────────

/// Look for the next inbound frame at the front of `buf`.
///
/// Detection is permissive: whichever recognizable opening marker comes
/// first decides the frame kind, and anything before it is discarded.
pub fn scan_inbound(buf: &[u8]) -> Scanned {
    let lead = buf
        .iter()
        .take_while(|b| b.is_ascii_whitespace() || **b == FRAME_TERMINATOR)
        .count();
    if lead > 0 {
        return Scanned::Skip(lead);
    }
    if buf.is_empty() {
        return Scanned::Incomplete;
    }

    let query = QUERY_MARKERS
        .iter()
        .filter_map(|m| find(buf, m).map(|at| (at, m.len())))
        .min_by_key(|(at, _)| *at);
    let source = find(buf, SOURCE_OPEN);

    match (query, source) {
        (Some((at, len)), s) if s.map_or(true, |s| at < s) => Scanned::Frame(at + len, Frame::Query),
        (_, Some(start)) => match find(&buf[start..], SOURCE_CLOSE) {
            Some(rel) => {
                let end = start + rel + SOURCE_CLOSE.len();
                match decode_announcement(&buf[start..end]) {
                    Ok(ann) => Scanned::Frame(end, Frame::Announce(ann)),
                    Err(e) => Scanned::Malformed(end, e),
                }
            }
            None if buf.len() > MAX_INBOUND_FRAME => {
                Scanned::Malformed(buf.len(), WireError::TooLarge(buf.len()))
            }
            None => Scanned::Incomplete,
        },
        _ => scan_unrecognized(buf),
    }
}

/// No marker present: keep a trailing partial tag, drop the rest.
fn scan_unrecognized(buf: &[u8]) -> Scanned {
    if buf.len() > MAX_INBOUND_FRAME {
        return Scanned::Malformed(buf.len(), WireError::TooLarge(buf.len()));
    }
    let partial_tag = buf
        .iter()
        .rposition(|b| *b == b'<')
        .filter(|&lt| !buf[lt..].contains(&b'>'));
    match partial_tag {
        Some(0) => Scanned::Incomplete,
        Some(lt) => Scanned::Malformed(lt, WireError::Unrecognized),
        None => Scanned::Malformed(buf.len(), WireError::Unrecognized),
    }
}

/// Parse a `<source>` element into an announcement.
pub fn decode_announcement(bytes: &[u8]) -> Result<Announcement, WireError> {
    let text = std::str::from_utf8(bytes).map_err(|_| WireError::NotUtf8)?;
    let root = markup::parse(text)?;
    if root.name != "source" {
        return Err(WireError::UnexpectedElement(root.name));
    }
    announcement_from(&root)
}

fn announcement_from(el: &Element) -> Result<Announcement, WireError> {
    let address = match el.child_text("address") {
        None | Some("") => None,
        Some(a) => Some(parse_ipv4(a).ok_or_else(|| WireError::BadAddress(a.to_string()))?),
    };
    Ok(Announcement {
        name: el.child_text("name").unwrap_or_default().to_string(),
        address,
        port: port_from(el)?,
        groups: groups_from(el),
    })
}

fn port_from(el: &Element) -> Result<u16, WireError> {
    match el.child_text("port") {
        None | Some("") => Ok(DEFAULT_SOURCE_PORT),
        Some(p) => p.parse().map_err(|_| WireError::BadPort(p.to_string())),
    }
}

fn groups_from(el: &Element) -> Vec<String> {
    let groups: Vec<String> = el
        .child("groups")
        .map(|g| {
            g.children_named("group")
                .map(|g| g.text.trim().to_string())
                .collect()
        })
        .unwrap_or_default();
    if groups.is_empty() {
        vec![DEFAULT_GROUP.to_string()]
    } else {
        groups
    }
}

fn descriptor_from(el: &Element) -> Result<SourceDescriptor, WireError> {
    let address = el
        .child_text("address")
        .ok_or(WireError::MissingField("address"))?;
    Ok(SourceDescriptor {
        name: el.child_text("name").unwrap_or_default().to_string(),
        metadata: el.child("metadata").map(|m| m.text.clone()).unwrap_or_default(),
        address: parse_ipv4(address).ok_or_else(|| WireError::BadAddress(address.to_string()))?,
        port: port_from(el)?,
        groups: groups_from(el),
    })
}

/// Parse a `<sources>` list as sent by a discovery server.
pub fn decode_sources(bytes: &[u8]) -> Result<Vec<SourceDescriptor>, WireError> {
    let text = std::str::from_utf8(bytes).map_err(|_| WireError::NotUtf8)?;
    let root = markup::parse(text)?;
    if root.name != "sources" {
        return Err(WireError::UnexpectedElement(root.name));
    }
    root.children_named("source").map(descriptor_from).collect()
}

/// Byte range `[start, end)` of the first complete `<sources>` block,
/// self-closed `<sources/>` included.
pub fn find_sources_block(buf: &[u8]) -> Option<(usize, usize)> {
    let empty = find(buf, SOURCES_EMPTY).map(|at| (at, at + SOURCES_EMPTY.len()));
    let open = find(buf, SOURCES_OPEN);
    match (open, empty) {
        (Some(start), e) if e.map_or(true, |(at, _)| start < at) => {
            let rel = find(&buf[start..], SOURCES_CLOSE)?;
            Some((start, start + rel + SOURCES_CLOSE.len()))
        }
        (_, e) => e,
    }
}

// ── Outbound ──────────────────────────────────────────────────────────────────

fn write_source(out: &mut String, src: &SourceDescriptor) {
    out.push_str("<source>");
    write_field(out, "name", &src.name);
    write_field(out, "metadata", &src.metadata);
    let _ = write!(out, "<address>{}</address><port>{}</port>", src.address, src.port);
    if src.groups.is_empty() {
        out.push_str("<groups/>");
    } else {
        out.push_str("<groups>");
        for group in &src.groups {
            write_field(out, "group", group);
        }
        out.push_str("</groups>");
    }
    out.push_str("</source>");
}

fn write_field(out: &mut String, tag: &str, value: &str) {
    if value.is_empty() {
        let _ = write!(out, "<{tag}/>");
    } else {
        let _ = write!(out, "<{tag}>{}</{tag}>", escape(value));
    }
}

/// `<source>…</source>`.
pub fn encode_source(src: &SourceDescriptor) -> String {
    let mut out = String::new();
    write_source(&mut out, src);
    out
}

/// `<sources>…</sources>`, or `<sources/>` for an empty list.
pub fn encode_sources(list: &[SourceDescriptor]) -> String {
    if list.is_empty() {
        return "<sources/>".to_string();
    }
    let mut out = String::from("<sources>");
    for src in list {
        write_source(&mut out, src);
    }
    out.push_str("</sources>");
    out
}

pub fn encode_add(src: &SourceDescriptor) -> String {
    format!("<add_source>{}</add_source>", encode_source(src))
}

pub fn encode_remove(src: &SourceDescriptor) -> String {
    format!("<remove_source>{}</remove_source>", encode_source(src))
}

/// Append the NUL terminator.
pub fn frame(message: String) -> Vec<u8> {
    let mut bytes = message.into_bytes();
    bytes.push(FRAME_TERMINATOR);
    bytes
}

/// `<query/>`, as a client would send it.
pub fn encode_query() -> &'static str {
    "<query/>"
}

/// `<source>…</source>` announcement, as a sender would send it.
pub fn encode_announcement(ann: &Announcement) -> String {
    let mut out = String::from("<source>");
    write_field(&mut out, "name", &ann.name);
    if let Some(addr) = ann.address {
        let _ = write!(out, "<address>{addr}</address>");
    }
    let _ = write!(out, "<port>{}</port><groups>", ann.port);
    for group in &ann.groups {
        write_field(&mut out, "group", group);
    }
    out.push_str("</groups></source>");
    out
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("malformed markup: {0}")]
    Malformed(String),

    #[error("message is not valid UTF-8")]
    NotUtf8,

    #[error("unexpected element <{0}>")]
    UnexpectedElement(String),

    #[error("missing <{0}> element")]
    MissingField(&'static str),

    #[error("invalid IPv4 address {0:?}")]
    BadAddress(String),

    #[error("invalid port {0:?}")]
    BadPort(String),

    #[error("no recognizable message")]
    Unrecognized,

    #[error("{0} bytes buffered without a complete message")]
    TooLarge(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
