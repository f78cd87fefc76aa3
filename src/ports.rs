// src/ports.rs

//! Port specifications.
//!
//! A [`PortSpec`] is the normalized form of an operator-supplied port list such
//! as `"80,443,8000-8010"`. Discrete ports covered by a range are folded into
//! it, and overlapping or adjacent ranges are merged. The spec spanning every
//! port (`"*"` or `"all"`) is reserved: it means "observe, never redirect".

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::driver::{Filter, PortField};

pub const PORT_MIN: u16 = 1;
pub const PORT_MAX: u16 = 65535;

/// Largest range the port-forward fallback will expand into individual rules.
pub const MAX_EXPANDED_RANGE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        if start <= end {
            PortRange { start, end }
        } else {
            PortRange {
                start: end,
                end: start,
            }
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    /// Number of ports covered.
    pub fn span(&self) -> usize {
        (self.end - self.start) as usize + 1
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    ports: Vec<u16>,
    ranges: Vec<PortRange>,
}

impl PortSpec {
    pub fn empty() -> Self {
        PortSpec::default()
    }

    /// The listen-only sentinel covering 1..=65535.
    pub fn all() -> Self {
        PortSpec {
            ports: Vec::new(),
            ranges: vec![PortRange::new(PORT_MIN, PORT_MAX)],
        }
    }

    pub fn single(port: u16) -> Self {
        PortSpec::from_parts(vec![port], Vec::new())
    }

    /// Parses a comma or whitespace separated list of ports and ranges.
    ///
    /// Unparseable tokens and out-of-bounds ports are skipped; range bounds are
    /// clamped to `1..=65535` and reversed ranges are swapped.
    ///
    /// # Examples
    ///
    /// ```
    /// use packet_forge::ports::PortSpec;
    ///
    /// let spec = PortSpec::parse("80,443,8000-8010");
    /// assert_eq!(spec.ports(), &[80, 443]);
    /// assert_eq!(spec.ranges().len(), 1);
    /// assert!(PortSpec::parse("all").is_all());
    /// ```
    pub fn parse(input: &str) -> Self {
        let mut ports = Vec::new();
        let mut ranges = Vec::new();

        for token in input
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            if token == "*" || token.eq_ignore_ascii_case("all") {
                return PortSpec::all();
            }

            if let Some((start, end)) = token.split_once('-') {
                let (Ok(start), Ok(end)) = (start.trim().parse::<i64>(), end.trim().parse::<i64>())
                else {
                    continue;
                };
                let start = clamp_port(start);
                let end = clamp_port(end);
                let range = PortRange::new(start, end);
                if range.start == range.end {
                    ports.push(range.start);
                } else {
                    ranges.push(range);
                }
                continue;
            }

            if let Ok(port) = token.parse::<i64>() {
                if port >= PORT_MIN as i64 && port <= PORT_MAX as i64 {
                    ports.push(port as u16);
                }
            }
        }

        PortSpec::from_parts(ports, ranges)
    }

    /// Parses `input`, falling back to `default` when the input is missing or blank.
    pub fn parse_or(input: Option<&str>, default: &str) -> Self {
        match input.map(str::trim).filter(|s| !s.is_empty()) {
            Some(value) => PortSpec::parse(value),
            None => PortSpec::parse(default),
        }
    }

    pub fn from_parts(mut ports: Vec<u16>, mut ranges: Vec<PortRange>) -> Self {
        ranges.sort();
        let mut merged: Vec<PortRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if range.start as u32 <= last.end as u32 + 1 => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }

        ports.retain(|p| *p >= PORT_MIN && !merged.iter().any(|r| r.contains(*p)));
        ports.sort_unstable();
        ports.dedup();

        PortSpec {
            ports,
            ranges: merged,
        }
    }

    /// Union of several specs.
    pub fn merge(specs: &[&PortSpec]) -> Self {
        let ports = specs.iter().flat_map(|s| s.ports.iter().copied()).collect();
        let ranges = specs.iter().flat_map(|s| s.ranges.iter().copied()).collect();
        PortSpec::from_parts(ports, ranges)
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn ranges(&self) -> &[PortRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty() && self.ranges.is_empty()
    }

    pub fn is_all(&self) -> bool {
        self.ports.is_empty()
            && self.ranges.len() == 1
            && self.ranges[0].start == PORT_MIN
            && self.ranges[0].end == PORT_MAX
    }

    pub fn contains(&self, port: u16) -> bool {
        self.ports.contains(&port) || self.ranges.iter().any(|r| r.contains(port))
    }

    /// Builds a filter clause matching `field` against every port and range.
    ///
    /// Returns `None` for an empty spec.
    pub fn to_filter(&self, field: PortField) -> Option<Filter> {
        let mut clauses: Vec<Filter> = self
            .ports
            .iter()
            .map(|p| Filter::Port(field, *p))
            .collect();
        clauses.extend(
            self.ranges
                .iter()
                .map(|r| Filter::PortRange(field, r.start, r.end)),
        );

        match clauses.len() {
            0 => None,
            1 => clauses.pop(),
            _ => Some(Filter::Or(clauses)),
        }
    }

    /// Lists every individual port, for backends that cannot express ranges.
    pub fn expand(&self) -> Result<Vec<u16>, String> {
        let mut out = self.ports.clone();
        for range in &self.ranges {
            if range.span() > MAX_EXPANDED_RANGE {
                return Err(format!(
                    "Port range {}-{} is too large to expand ({} ports, limit {})",
                    range.start,
                    range.end,
                    range.span(),
                    MAX_EXPANDED_RANGE
                ));
            }
            out.extend(range.start..=range.end);
        }
        out.sort_unstable();
        out.dedup();
        Ok(out)
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            return write!(f, "*");
        }
        let parts: Vec<String> = self
            .ports
            .iter()
            .map(|p| p.to_string())
            .chain(self.ranges.iter().map(|r| format!("{}-{}", r.start, r.end)))
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

fn clamp_port(value: i64) -> u16 {
    value.clamp(PORT_MIN as i64, PORT_MAX as i64) as u16
}
