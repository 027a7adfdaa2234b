//! Hierarchical resource identifiers.
//!
//! An identifier is a slash-delimited list of `key/value` pairs, e.g.
//! `/subscriptions/{sub}/resourceGroups/{group}/providers/Microsoft.Cache/redis/{name}`.
//! Parsing is purely syntactic. Values keep their casing, but every
//! "is this the same resource" comparison is case-insensitive, matching the
//! control plane.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ParseError;

/// An ordered sequence of named path segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId {
    segments: Vec<(String, String)>,
}

impl ResourceId {
    /// Parse the canonical string form. A single trailing `/` is tolerated.
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let malformed = |reason: String| ParseError::MalformedId {
            input: input.to_string(),
            reason,
        };

        if input.is_empty() {
            return Err(malformed("identifier is empty".into()));
        }
        let Some(rest) = input.strip_prefix('/') else {
            return Err(malformed("identifier must start with '/'".into()));
        };
        let rest = rest.strip_suffix('/').unwrap_or(rest);
        if rest.is_empty() {
            return Err(malformed("identifier has no segments".into()));
        }

        let parts: Vec<&str> = rest.split('/').collect();
        if let Some(pos) = parts.iter().position(|p| p.is_empty()) {
            return Err(malformed(format!("segment {} is empty", pos + 1)));
        }
        if parts.len() % 2 != 0 {
            return Err(malformed(format!(
                "segment {:?} has no value",
                parts[parts.len() - 1]
            )));
        }

        let segments = parts
            .chunks(2)
            .map(|pair| (pair[0].to_string(), pair[1].to_string()))
            .collect();
        Ok(Self { segments })
    }

    /// Build an identifier from explicit segments.
    pub fn from_segments<K, V>(segments: impl IntoIterator<Item = (K, V)>) -> Result<Self, ParseError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let segments: Vec<(String, String)> = segments
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let id = Self { segments };
        if id.segments.is_empty() {
            return Err(ParseError::MalformedId {
                input: String::new(),
                reason: "identifier has no segments".into(),
            });
        }
        for (key, value) in &id.segments {
            for part in [key, value] {
                if part.is_empty() || part.contains('/') {
                    return Err(ParseError::MalformedId {
                        input: id.to_string(),
                        reason: format!("invalid segment {:?}", part),
                    });
                }
            }
        }
        Ok(id)
    }

    pub fn segments(&self) -> &[(String, String)] {
        &self.segments
    }

    /// Value of the first segment whose key matches case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.segments
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Value of the last segment, conventionally the resource's own name.
    pub fn name(&self) -> &str {
        self.segments
            .last()
            .map(|(_, v)| v.as_str())
            .unwrap_or_default()
    }

    /// Provider type such as `Microsoft.Network/networkInterfaces`.
    ///
    /// Identifiers without a `providers` segment yield their keys joined by `/`.
    pub fn resource_type(&self) -> String {
        match self
            .segments
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case("providers"))
        {
            Some(pos) => {
                let mut parts = vec![self.segments[pos].1.as_str()];
                parts.extend(self.segments[pos + 1..].iter().map(|(k, _)| k.as_str()));
                parts.join("/")
            }
            None => self
                .segments
                .iter()
                .map(|(k, _)| k.as_str())
                .collect::<Vec<_>>()
                .join("/"),
        }
    }

    /// Case-insensitive comparison on every segment.
    pub fn same_resource(&self, other: &ResourceId) -> bool {
        self.segments.len() == other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|((ak, av), (bk, bv))| {
                    ak.eq_ignore_ascii_case(bk) && av.eq_ignore_ascii_case(bv)
                })
    }

    /// Case-folded canonical form, for use as a map or lock key.
    pub fn lowercase(&self) -> String {
        self.to_string().to_lowercase()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.segments {
            write!(f, "/{}/{}", key, value)?;
        }
        Ok(())
    }
}

impl FromStr for ResourceId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ResourceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// One segment of an [`IdPattern`].
#[derive(Debug, Clone, Copy)]
pub enum Segment {
    /// Fixed key and value, e.g. `providers/Microsoft.Cache`.
    Static {
        key: &'static str,
        value: &'static str,
    },
    /// Fixed key with a variable value, e.g. `resourceGroups/{resource_group}`.
    Named {
        key: &'static str,
        name: &'static str,
    },
}

/// Shape of one kind of identifier.
#[derive(Debug, Clone, Copy)]
pub struct IdPattern {
    pub label: &'static str,
    pub segments: &'static [Segment],
}

impl IdPattern {
    pub const fn new(label: &'static str, segments: &'static [Segment]) -> Self {
        Self { label, segments }
    }

    /// Parse `input` against this pattern.
    ///
    /// Keys and static values match case-insensitively and are rewritten to
    /// the pattern's casing. Returns the normalized identifier and the named
    /// values in pattern order.
    pub fn parse(&self, input: &str) -> Result<(ResourceId, Vec<String>), ParseError> {
        let id = ResourceId::parse(input)?;
        let unexpected = |reason: String| ParseError::UnexpectedSegment {
            input: input.to_string(),
            expected: self.label,
            reason,
        };

        if id.segments.len() != self.segments.len() {
            return Err(unexpected(format!(
                "expected {} segments, found {}",
                self.segments.len(),
                id.segments.len()
            )));
        }

        let mut normalized = Vec::with_capacity(self.segments.len());
        let mut values = Vec::new();
        for (segment, (key, value)) in self.segments.iter().zip(&id.segments) {
            match *segment {
                Segment::Static {
                    key: want_key,
                    value: want_value,
                } => {
                    if !key.eq_ignore_ascii_case(want_key) || !value.eq_ignore_ascii_case(want_value)
                    {
                        return Err(unexpected(format!(
                            "expected {}/{}, found {}/{}",
                            want_key, want_value, key, value
                        )));
                    }
                    normalized.push((want_key.to_string(), want_value.to_string()));
                }
                Segment::Named {
                    key: want_key,
                    name,
                } => {
                    if !key.eq_ignore_ascii_case(want_key) {
                        return Err(unexpected(format!(
                            "expected key {:?} for {}, found {:?}",
                            want_key, name, key
                        )));
                    }
                    normalized.push((want_key.to_string(), value.clone()));
                    values.push(value.clone());
                }
            }
        }

        Ok((ResourceId { segments: normalized }, values))
    }

    /// Build an identifier from named values in pattern order.
    pub fn format(&self, values: &[&str]) -> Result<ResourceId, ParseError> {
        let mut values = values.iter();
        let mut segments = Vec::with_capacity(self.segments.len());
        for segment in self.segments {
            match *segment {
                Segment::Static { key, value } => segments.push((key, value.to_string())),
                Segment::Named { key, name } => {
                    let value = values.next().ok_or_else(|| ParseError::UnexpectedSegment {
                        input: String::new(),
                        expected: self.label,
                        reason: format!("missing value for {}", name),
                    })?;
                    segments.push((key, value.to_string()));
                }
            }
        }
        ResourceId::from_segments(segments)
    }
}

/// Split `values` from [`IdPattern::parse`] into a fixed-size array.
pub(crate) fn take_values<const N: usize>(
    pattern: &IdPattern,
    input: &str,
    values: Vec<String>,
) -> Result<[String; N], ParseError> {
    <[String; N]>::try_from(values).map_err(|v| ParseError::UnexpectedSegment {
        input: input.to_string(),
        expected: pattern.label,
        reason: format!("expected {} named values, found {}", N, v.len()),
    })
}
