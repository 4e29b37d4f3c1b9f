//! Hierarchical step instance addresses.
//!
//! A [`FullQualifiedId`] names one step or group instance inside a job as the
//! path of declared ids from the root group down to the instance. Iterated
//! groups add the iteration index to their segment, so the same declared step
//! gets a distinct id in every iteration: `launch/attach[1]/resume`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StepperError;

/// One path segment: a declared id plus an optional iteration index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Segment {
    pub id: String,
    pub iteration: Option<usize>,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.iteration {
            Some(i) => write!(f, "{}[{}]", self.id, i),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Hierarchical address of a step instance within a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct FullQualifiedId {
    segments: Vec<Segment>,
}

impl FullQualifiedId {
    /// The empty id; scope of unscoped job data.
    pub fn root() -> Self {
        Self::default()
    }

    /// A single-segment id.
    pub fn new(id: impl Into<String>) -> Self {
        Self::root().child(id)
    }

    /// Extend with a declared child id.
    pub fn child(&self, id: impl Into<String>) -> Self {
        self.push(Segment {
            id: id.into(),
            iteration: None,
        })
    }

    /// Extend with a declared child id and iteration index.
    pub fn child_iteration(&self, id: impl Into<String>, iteration: usize) -> Self {
        self.push(Segment {
            id: id.into(),
            iteration: Some(iteration),
        })
    }

    fn push(&self, segment: Segment) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Self { segments }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Declared id of the last segment.
    pub fn declared_id(&self) -> Option<&str> {
        self.segments.last().map(|s| s.id.as_str())
    }

    /// Iteration index of the last segment.
    pub fn iteration(&self) -> Option<usize> {
        self.segments.last().and_then(|s| s.iteration)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// This id followed by every ancestor up to and including the root.
    pub fn lineage(&self) -> impl Iterator<Item = FullQualifiedId> + '_ {
        (0..=self.segments.len()).rev().map(move |len| Self {
            segments: self.segments[..len].to_vec(),
        })
    }

    /// Strict prefix containment.
    pub fn is_ancestor_of(&self, other: &FullQualifiedId) -> bool {
        self.segments.len() < other.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    pub fn is_self_or_ancestor_of(&self, other: &FullQualifiedId) -> bool {
        self == other || self.is_ancestor_of(other)
    }
}

impl fmt::Display for FullQualifiedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}

impl FromStr for FullQualifiedId {
    type Err = StepperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for part in s.split('/') {
            let segment = match part.strip_suffix(']').and_then(|p| p.split_once('[')) {
                Some((id, index)) => {
                    let iteration = index.parse::<usize>().map_err(|_| {
                        StepperError::Configuration(format!("invalid iteration index in '{}'", s))
                    })?;
                    Segment {
                        id: id.to_string(),
                        iteration: Some(iteration),
                    }
                }
                None => Segment {
                    id: part.to_string(),
                    iteration: None,
                },
            };
            if segment.id.is_empty() {
                return Err(StepperError::Configuration(format!(
                    "empty segment in id '{}'",
                    s
                )));
            }
            segments.push(segment);
        }
        Ok(Self { segments })
    }
}

impl From<FullQualifiedId> for String {
    fn from(id: FullQualifiedId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for FullQualifiedId {
    type Error = StepperError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}
