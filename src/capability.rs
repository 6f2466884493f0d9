// src/capability.rs

//! Capabilities and RPM-style version constraints.
//!
//! A capability is a `(name, version constraint)` pair; packages `Provide`
//! capabilities at exact versions and `Require` capabilities over ranges.
//! Constraints are modelled as intervals with inclusivity flags; a provide
//! satisfies a requirement when the two intervals intersect.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Error raised when parsing capability or version strings.
#[derive(Debug, Error)]
pub enum CapabilityParseError {
    #[error("empty capability string")]
    Empty,
    #[error("unknown comparison operator '{0}'")]
    UnknownOperator(String),
    #[error("capability '{0}' has an operator but no version")]
    MissingVersion(String),
    #[error("trailing tokens in capability string '{0}'")]
    TrailingTokens(String),
}

/// Comparison operator in a versioned requirement, e.g. `bash >= 4.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl CompareOp {
    pub fn parse(s: &str) -> Result<Self, CapabilityParseError> {
        match s {
            "=" | "==" => Ok(CompareOp::Equal),
            "<" => Ok(CompareOp::Less),
            "<=" => Ok(CompareOp::LessOrEqual),
            ">" => Ok(CompareOp::Greater),
            ">=" => Ok(CompareOp::GreaterOrEqual),
            other => Err(CapabilityParseError::UnknownOperator(other.to_string())),
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Equal => "=",
            CompareOp::Less => "<",
            CompareOp::LessOrEqual => "<=",
            CompareOp::Greater => ">",
            CompareOp::GreaterOrEqual => ">=",
        };
        f.write_str(s)
    }
}

/// An RPM version of the form `[epoch:]version[-release]`.
///
/// Comparison follows rpmvercmp segment rules. A missing release acts as a
/// wildcard: if either side carries no release, releases are ignored, so
/// `1.0` compares equal to `1.0-5`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub epoch: u64,
    pub upstream: String,
    pub release: Option<String>,
}

impl Version {
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        let (epoch, rest) = match s.split_once(':') {
            Some((e, rest)) => (e.parse::<u64>().unwrap_or(0), rest),
            None => (0, s),
        };
        let (upstream, release) = match rest.split_once('-') {
            Some((v, r)) => (v.to_string(), Some(r.to_string())),
            None => (rest.to_string(), None),
        };
        Version {
            epoch,
            upstream,
            release,
        }
    }

    /// rpmvercmp-style comparison over epoch, version and (when both sides
    /// carry one) release.
    pub fn compare(&self, other: &Version) -> Ordering {
        let ord = self.epoch.cmp(&other.epoch);
        if ord != Ordering::Equal {
            return ord;
        }
        let ord = rpm_segment_cmp(&self.upstream, &other.upstream);
        if ord != Ordering::Equal {
            return ord;
        }
        match (&self.release, &other.release) {
            (Some(a), Some(b)) => rpm_segment_cmp(a, b),
            _ => Ordering::Equal,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch != 0 {
            write!(f, "{}:", self.epoch)?;
        }
        f.write_str(&self.upstream)?;
        if let Some(rel) = &self.release {
            write!(f, "-{rel}")?;
        }
        Ok(())
    }
}

/// Compare two version fragments with rpmvercmp segment rules:
/// alternating alphabetic and numeric segments, numeric segments compared as
/// integers (leading zeros ignored), numeric beats alphabetic, `~` sorts
/// before everything including the end of the string.
fn rpm_segment_cmp(a: &str, b: &str) -> Ordering {
    let mut a = a.as_bytes();
    let mut b = b.as_bytes();

    loop {
        // Tilde segments sort lowest, even against an empty remainder.
        let a_tilde = a.first() == Some(&b'~');
        let b_tilde = b.first() == Some(&b'~');
        match (a_tilde, b_tilde) {
            (true, true) => {
                a = &a[1..];
                b = &b[1..];
                continue;
            }
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }

        // Skip separators (anything that is not alphanumeric).
        while let Some(c) = a.first() {
            if c.is_ascii_alphanumeric() {
                break;
            }
            a = &a[1..];
        }
        while let Some(c) = b.first() {
            if c.is_ascii_alphanumeric() {
                break;
            }
            b = &b[1..];
        }

        if a.is_empty() || b.is_empty() {
            return a.len().cmp(&b.len());
        }

        let a_numeric = a[0].is_ascii_digit();
        let b_numeric = b[0].is_ascii_digit();

        // A numeric segment is always newer than an alphabetic one.
        if a_numeric != b_numeric {
            return if a_numeric {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }

        let (a_seg, a_rest) = take_segment(a, a_numeric);
        let (b_seg, b_rest) = take_segment(b, b_numeric);
        a = a_rest;
        b = b_rest;

        let ord = if a_numeric {
            let a_trim = trim_leading_zeros(a_seg);
            let b_trim = trim_leading_zeros(b_seg);
            a_trim
                .len()
                .cmp(&b_trim.len())
                .then_with(|| a_trim.cmp(b_trim))
        } else {
            a_seg.cmp(b_seg)
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
}

fn take_segment(s: &[u8], numeric: bool) -> (&[u8], &[u8]) {
    let end = s
        .iter()
        .position(|c| c.is_ascii_digit() != numeric || !c.is_ascii_alphanumeric())
        .unwrap_or(s.len());
    s.split_at(end)
}

fn trim_leading_zeros(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|&c| c != b'0').unwrap_or(s.len());
    &s[start..]
}

/// One end of a version interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntervalBound {
    Unbounded,
    Inclusive(Version),
    Exclusive(Version),
}

/// A version range with inclusivity flags on both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInterval {
    pub lo: IntervalBound,
    pub hi: IntervalBound,
}

impl VersionInterval {
    pub fn unbounded() -> Self {
        VersionInterval {
            lo: IntervalBound::Unbounded,
            hi: IntervalBound::Unbounded,
        }
    }

    pub fn from_op(op: CompareOp, version: Version) -> Self {
        use IntervalBound::*;
        match op {
            CompareOp::Equal => VersionInterval {
                lo: Inclusive(version.clone()),
                hi: Inclusive(version),
            },
            CompareOp::Less => VersionInterval {
                lo: Unbounded,
                hi: Exclusive(version),
            },
            CompareOp::LessOrEqual => VersionInterval {
                lo: Unbounded,
                hi: Inclusive(version),
            },
            CompareOp::Greater => VersionInterval {
                lo: Exclusive(version),
                hi: Unbounded,
            },
            CompareOp::GreaterOrEqual => VersionInterval {
                lo: Inclusive(version),
                hi: Unbounded,
            },
        }
    }

    /// True when the two intervals share at least one version.
    ///
    /// For the common case of a point provide (`= v`) against a required
    /// range this is exactly "the required range contains `v`".
    pub fn intersects(&self, other: &VersionInterval) -> bool {
        lower_below_upper(&self.lo, &other.hi) && lower_below_upper(&other.lo, &self.hi)
    }
}

fn lower_below_upper(lo: &IntervalBound, hi: &IntervalBound) -> bool {
    use IntervalBound::*;
    match (lo, hi) {
        (Unbounded, _) | (_, Unbounded) => true,
        (Inclusive(l), Inclusive(h)) => l.compare(h) != Ordering::Greater,
        (Inclusive(l), Exclusive(h))
        | (Exclusive(l), Inclusive(h))
        | (Exclusive(l), Exclusive(h)) => l.compare(h) == Ordering::Less,
    }
}

/// A named, versioned unit that packages provide and require.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub name: String,
    pub constraint: Option<(CompareOp, Version)>,
}

impl Capability {
    /// An unversioned capability, satisfied by any provided version.
    pub fn unversioned(name: impl Into<String>) -> Self {
        Capability {
            name: name.into(),
            constraint: None,
        }
    }

    pub fn versioned(name: impl Into<String>, op: CompareOp, version: Version) -> Self {
        Capability {
            name: name.into(),
            constraint: Some((op, version)),
        }
    }

    /// The version interval described by this capability's constraint.
    pub fn interval(&self) -> VersionInterval {
        match &self.constraint {
            None => VersionInterval::unbounded(),
            Some((op, version)) => VersionInterval::from_op(*op, version.clone()),
        }
    }

    /// True when a package providing `self` satisfies a requirement on
    /// `other`: the names match and the version intervals intersect.
    pub fn satisfies(&self, required: &Capability) -> bool {
        self.name == required.name && self.interval().intersects(&required.interval())
    }

    /// True for the dependencies injected by the package manager itself
    /// (`rpmlib(...)`), which are never buildable and always filtered out.
    pub fn is_rpmlib(&self) -> bool {
        self.name.starts_with("rpmlib")
    }
}

impl FromStr for Capability {
    type Err = CapabilityParseError;

    /// Parse strings of the form `name`, `name = 1.2-3`, `name >= 2:4.0`.
    ///
    /// Names may contain parentheses and slashes (`config(foo)`, `/bin/sh`),
    /// matching what `rpm -qpR` emits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let name = parts.next().ok_or(CapabilityParseError::Empty)?;
        let Some(op_str) = parts.next() else {
            return Ok(Capability::unversioned(name));
        };
        let op = CompareOp::parse(op_str)?;
        let version = parts
            .next()
            .ok_or_else(|| CapabilityParseError::MissingVersion(s.to_string()))?;
        if parts.next().is_some() {
            return Err(CapabilityParseError::TrailingTokens(s.to_string()));
        }
        Ok(Capability::versioned(name, op, Version::parse(version)))
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.constraint {
            None => f.write_str(&self.name),
            Some((op, version)) => write!(f, "{} {} {}", self.name, op, version),
        }
    }
}
