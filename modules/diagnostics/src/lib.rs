//! Diagnostic categories and the argument vector each one runs.
//!
//! Arguments are built from a validated [`Target`] and enumerated options only,
//! and are handed to the program directly, never through a shell.

use lg_core::{Target, TargetError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Probe count for ping and mtr.
pub const PROBE_COUNT: &str = "4";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Ping,
    Traceroute,
    Whois,
    Host,
    Dig,
}

impl Category {
    pub const ALL: [Category; 5] = [Category::Ping, Category::Traceroute, Category::Whois, Category::Host, Category::Dig];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Ping => "ping",
            Category::Traceroute => "traceroute",
            Category::Whois => "whois",
            Category::Host => "host",
            Category::Dig => "dig",
        }
    }

    /// Whether the target is a single host/query or a free list of words.
    fn single_word(self) -> bool {
        matches!(self, Category::Ping | Category::Traceroute | Category::Whois)
    }

    fn takes_ip_version(self) -> bool {
        matches!(self, Category::Ping | Category::Traceroute)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown diagnostic category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// Address family forced on ping/traceroute. Ignored by the other categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpVersion {
    #[default]
    Any,
    V4,
    V6,
}

impl IpVersion {
    /// `None` or `""` mean any; otherwise `"4"` or `"6"`.
    pub fn parse(opt: Option<&str>) -> Result<Self, RequestError> {
        match opt.map(str::trim) {
            None | Some("") => Ok(IpVersion::Any),
            Some("4") => Ok(IpVersion::V4),
            Some("6") => Ok(IpVersion::V6),
            Some(other) => Err(RequestError::ProtocolVersion(other.to_string())),
        }
    }

    fn flag(self) -> Option<&'static str> {
        match self {
            IpVersion::Any => None,
            IpVersion::V4 => Some("-4"),
            IpVersion::V6 => Some("-6"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error("unknown protocol version {0:?}, expected 4 or 6")]
    ProtocolVersion(String),
}

/// Executable used for each category.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Programs {
    pub ping: String,
    pub traceroute: String,
    pub whois: String,
    pub host: String,
    pub dig: String,
}

impl Default for Programs {
    fn default() -> Self {
        Programs {
            ping: "ping".into(),
            traceroute: "mtr".into(),
            whois: "whois".into(),
            host: "host".into(),
            dig: "dig".into(),
        }
    }
}

impl Programs {
    pub fn for_category(&self, c: Category) -> &str {
        match c {
            Category::Ping => &self.ping,
            Category::Traceroute => &self.traceroute,
            Category::Whois => &self.whois,
            Category::Host => &self.host,
            Category::Dig => &self.dig,
        }
    }
}

/// A ready-to-spawn program and argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

/// Validate `raw_target` for `category` and build its invocation.
pub fn build(category: Category, raw_target: &str, version: IpVersion, programs: &Programs) -> Result<Invocation, RequestError> {
    let target = if category.single_word() { Target::parse_single(raw_target)? } else { Target::parse(raw_target)? };
    let mut args: Vec<String> = Vec::new();
    if category.takes_ip_version() {
        if let Some(flag) = version.flag() { args.push(flag.to_string()); }
    }
    match category {
        Category::Ping => {
            args.extend(["-c", PROBE_COUNT].map(String::from));
        }
        Category::Traceroute => {
            // report mode, wide, with AS numbers and MPLS/extension info
            args.extend(["-c", PROBE_COUNT, "-bez", "-w"].map(String::from));
        }
        Category::Whois | Category::Host | Category::Dig => {}
    }
    args.extend(target.words().map(String::from));
    Ok(Invocation { program: programs.for_category(category).to_string(), args })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(c: Category, t: &str, v: IpVersion) -> Vec<String> {
        build(c, t, v, &Programs::default()).unwrap().args
    }

    #[test]
    fn category_names_round_trip() {
        for c in Category::ALL {
            assert_eq!(c.as_str().parse::<Category>().unwrap(), c);
        }
        assert!("nmap".parse::<Category>().is_err());
    }

    #[test]
    fn ping_args() {
        assert_eq!(argv(Category::Ping, " example.com ", IpVersion::Any), ["-c", "4", "example.com"]);
        assert_eq!(argv(Category::Ping, "example.com", IpVersion::V6), ["-6", "-c", "4", "example.com"]);
    }

    #[test]
    fn traceroute_uses_mtr_report() {
        let inv = build(Category::Traceroute, "192.0.2.1", IpVersion::V4, &Programs::default()).unwrap();
        assert_eq!(inv.program, "mtr");
        assert_eq!(inv.args, ["-4", "-c", "4", "-bez", "-w", "192.0.2.1"]);
    }

    #[test]
    fn dig_and_host_split_words() {
        assert_eq!(argv(Category::Dig, "example.org  MX +short", IpVersion::Any), ["example.org", "MX", "+short"]);
        let err = build(Category::Host, "-l example.org", IpVersion::Any, &Programs::default()).unwrap_err();
        assert!(matches!(err, RequestError::Target(TargetError::OptionLike(_))));
    }

    #[test]
    fn ip_version_ignored_for_lookups() {
        assert_eq!(argv(Category::Whois, "AS13335", IpVersion::V4), ["AS13335"]);
    }

    #[test]
    fn single_word_categories_reject_extra_words() {
        let err = build(Category::Ping, "example.com -f", IpVersion::Any, &Programs::default()).unwrap_err();
        assert!(matches!(err, RequestError::Target(TargetError::OptionLike(_))));
        let err = build(Category::Whois, "example.com extra", IpVersion::Any, &Programs::default()).unwrap_err();
        assert_eq!(err, RequestError::Target(TargetError::NotSingleWord));
    }

    #[test]
    fn protocol_version_is_enumerated() {
        assert_eq!(IpVersion::parse(None).unwrap(), IpVersion::Any);
        assert_eq!(IpVersion::parse(Some("")).unwrap(), IpVersion::Any);
        assert_eq!(IpVersion::parse(Some("4")).unwrap(), IpVersion::V4);
        assert!(IpVersion::parse(Some("5")).is_err());
    }
}
