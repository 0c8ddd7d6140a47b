//! Visibility policy — which watchers may see which sources.
//!
//! A policy is an ordered list of [`FilterRule`]s. The rule governing a
//! source is the one whose `range` contains the source address with the
//! longest prefix; ties go to the earliest-listed rule. No matching rule,
//! or a rule whose default is `share`, means everyone sees the source.
//!
//! Only IPv4 is in scope. IPv4-mapped IPv6 input (`::ffff:a.b.c.d`) is
//! normalized before matching.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── CIDR ─────────────────────────────────────────────────────────────────────

/// An IPv4 address range in `base/prefix` notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr {
    base: Ipv4Addr,
    prefix: u8,
}

impl Cidr {
    /// Everything: `0.0.0.0/0`.
    pub const ANY: Cidr = Cidr {
        base: Ipv4Addr::UNSPECIFIED,
        prefix: 0,
    };

    pub fn new(base: Ipv4Addr, prefix: u8) -> Result<Self, PolicyError> {
        if prefix > 32 {
            return Err(PolicyError::PrefixTooLong(prefix));
        }
        Ok(Self { base, prefix })
    }

    pub fn base(&self) -> Ipv4Addr {
        self.base
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Network mask for this prefix. `/0` yields zero rather than
    /// shifting a u32 by 32.
    pub fn mask(&self) -> u32 {
        prefix_mask(self.prefix)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = self.mask();
        u32::from(addr) & mask == u32::from(self.base) & mask
    }
}

/// Mask with the top `prefix` bits set.
pub fn prefix_mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - u32::from(p)),
    }
}

impl FromStr for Cidr {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let prefix = prefix
                    .trim()
                    .parse::<u8>()
                    .map_err(|_| PolicyError::InvalidCidr(s.to_string()))?;
                (addr, prefix)
            }
            None => (s, 32),
        };
        let base = parse_ipv4(addr).ok_or_else(|| PolicyError::InvalidCidr(s.to_string()))?;
        Cidr::new(base, prefix)
    }
}

impl TryFrom<String> for Cidr {
    type Error = PolicyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cidr> for String {
    fn from(c: Cidr) -> String {
        c.to_string()
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix)
    }
}

// ── Address normalization ────────────────────────────────────────────────────

/// Reduce a socket-level address to IPv4, unwrapping `::ffff:a.b.c.d`.
/// Returns `None` for genuine IPv6 addresses.
pub fn normalize_ip(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

/// Parse a textual IPv4 address, tolerating the `::ffff:` mapped prefix.
pub fn parse_ipv4(s: &str) -> Option<Ipv4Addr> {
    let s = s.trim();
    let s = s
        .strip_prefix("::ffff:")
        .or_else(|| s.strip_prefix("::FFFF:"))
        .unwrap_or(s);
    s.parse().ok()
}

// ── Rules ────────────────────────────────────────────────────────────────────

/// What a rule does for watchers outside its authorized list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ShareDefault {
    /// Everyone sees sources in the range.
    #[default]
    Share,
    /// Only authorized watchers (and watchers inside the range) see them.
    Block,
}

impl From<String> for ShareDefault {
    /// `share` (any case) shares; every other value requires authorization.
    fn from(value: String) -> Self {
        if value.trim().eq_ignore_ascii_case("share") {
            ShareDefault::Share
        } else {
            ShareDefault::Block
        }
    }
}

impl From<ShareDefault> for String {
    fn from(d: ShareDefault) -> String {
        match d {
            ShareDefault::Share => "share".to_string(),
            ShareDefault::Block => "block".to_string(),
        }
    }
}

/// One network's visibility policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub name: String,
    /// Which announcing sources this rule governs.
    pub range: Cidr,
    #[serde(default)]
    pub default: ShareDefault,
    /// Watcher ranges allowed to see `range` when `default` is `Block`.
    #[serde(default)]
    pub authorized: Vec<Cidr>,
}

/// Policy details attached to a source for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyAnnotation {
    /// Matched rule name, or `"unknown"` when no rule applies.
    pub group_name: String,
    pub rule_range: Option<Cidr>,
    /// Watcher ranges that can see the source.
    pub watchers: Vec<Cidr>,
}

/// Ordered, immutable list of rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySet {
    rules: Vec<FilterRule>,
}

impl PolicySet {
    pub fn new(rules: Vec<FilterRule>) -> Self {
        Self { rules }
    }

    /// Fail-open policy: every source visible to every watcher.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Most specific rule whose range contains `addr`.
    pub fn find_rule(&self, addr: Ipv4Addr) -> Option<&FilterRule> {
        let mut best: Option<&FilterRule> = None;
        for rule in &self.rules {
            if !rule.range.contains(addr) {
                continue;
            }
            // Strictly greater: equal prefixes keep the earlier rule.
            if best.map_or(true, |b| rule.range.prefix() > b.range.prefix()) {
                best = Some(rule);
            }
        }
        best
    }

    /// May a watcher at `watcher` see a source announced at `source`?
    pub fn can_share(&self, source: Ipv4Addr, watcher: Ipv4Addr) -> bool {
        let rule = match self.find_rule(source) {
            Some(r) => r,
            None => return true,
        };
        if rule.default == ShareDefault::Share {
            return true;
        }
        rule.authorized.iter().any(|cidr| cidr.contains(watcher)) || rule.range.contains(watcher)
    }

    /// Matched rule name, or `"unknown"`.
    pub fn group_name(&self, addr: Ipv4Addr) -> &str {
        self.find_rule(addr)
            .map(|r| r.name.as_str())
            .unwrap_or("unknown")
    }

    pub fn annotate(&self, addr: Ipv4Addr) -> PolicyAnnotation {
        match self.find_rule(addr) {
            None => PolicyAnnotation {
                group_name: "unknown".to_string(),
                rule_range: None,
                watchers: vec![Cidr::ANY],
            },
            Some(rule) => {
                let watchers = match rule.default {
                    ShareDefault::Share => vec![Cidr::ANY],
                    ShareDefault::Block => {
                        let mut w = rule.authorized.clone();
                        w.push(rule.range);
                        w
                    }
                };
                PolicyAnnotation {
                    group_name: rule.name.clone(),
                    rule_range: Some(rule.range),
                    watchers,
                }
            }
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("invalid CIDR: {0:?}")]
    InvalidCidr(String),
    #[error("prefix length {0} exceeds 32")]
    PrefixTooLong(u8),
}

// ── Tests ────────────────────────────────────────────────────────────────────
