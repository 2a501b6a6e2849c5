//! Flat, delimiter-safe path keys.
//!
//! Every node, index record and API payload refers to a file-system entry by a
//! [`FlatKey`]: the segments of its [`HierPath`] joined with `|`. Segment text is
//! escaped (`\` becomes `\\`, `|` becomes `\|`) so the mapping stays injective
//! for names that contain the delimiter.
//!
//! ```text
//! /home/ana/q3|draft.txt  ->  /|home|ana|q3\|draft.txt
//! C:\Reports\x.pdf         ->  C:|Reports|x.pdf
//! ```

use std::fmt;
use std::path::{Component, MAIN_SEPARATOR, Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Separator between segments of a flat key.
pub const DELIMITER: char = '|';

/// Escape character inside flat keys.
pub const ESCAPE: char = '\\';

/// Anchor segment for absolute Unix paths.
pub const UNIX_ANCHOR: &str = "/";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("empty path")]
    Empty,

    #[error("empty segment at position {0}")]
    EmptySegment(usize),

    #[error("reserved segment '{0}'")]
    ReservedSegment(String),

    #[error("segment contains a separator or NUL: {0:?}")]
    ForbiddenCharacter(String),

    #[error("invalid escape sequence in key: {0}")]
    BadEscape(String),

    #[error("path is not absolute: {0}")]
    NotAbsolute(String),

    #[error("path is not valid UTF-8: {0}")]
    NotUtf8(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("path has no parent: {0}")]
    NoParent(String),

    #[error("indexed roots overlap: {0} and {1}")]
    OverlappingRoots(String, String),
}

/// A path as an ordered list of segments.
///
/// The first segment of an absolute path is its anchor: `/` on Unix, the drive
/// prefix (`C:`) on Windows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HierPath {
    segments: Vec<String>,
}

impl HierPath {
    /// Build a path from segments, validating each one.
    pub fn new<I, S>(segments: I) -> Result<Self, PathError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(PathError::Empty);
        }
        for (position, segment) in segments.iter().enumerate() {
            validate_segment(position, segment)?;
        }
        Ok(Self { segments })
    }

    /// Convert an absolute file-system path.
    ///
    /// `.` and `..` components are rejected rather than resolved; callers
    /// canonicalize first.
    pub fn from_fs_path(path: &Path) -> Result<Self, PathError> {
        if !path.is_absolute() {
            return Err(PathError::NotAbsolute(path.display().to_string()));
        }

        let mut segments = Vec::new();
        for component in path.components() {
            match component {
                Component::Prefix(prefix) => segments.push(os_to_string(prefix.as_os_str())?),
                Component::RootDir => {
                    if segments.is_empty() {
                        segments.push(UNIX_ANCHOR.to_string());
                    }
                }
                Component::Normal(name) => segments.push(os_to_string(name)?),
                Component::CurDir | Component::ParentDir => {
                    return Err(PathError::NotAbsolute(path.display().to_string()));
                }
            }
        }

        Self::new(segments)
    }

    /// Convert back to a file-system path.
    pub fn to_fs_path(&self) -> PathBuf {
        let mut segments = self.segments.iter();
        let mut path = match segments.next().map(String::as_str) {
            Some(UNIX_ANCHOR) => PathBuf::from(UNIX_ANCHOR),
            Some(prefix) if prefix.ends_with(':') => {
                PathBuf::from(format!("{prefix}{MAIN_SEPARATOR}"))
            }
            Some(first) => PathBuf::from(first),
            None => PathBuf::new(),
        };
        for segment in segments {
            path.push(segment);
        }
        path
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Last segment (the entry's display name).
    pub fn file_name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    pub fn parent(&self) -> Option<HierPath> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Append one segment.
    pub fn join(&self, name: &str) -> Result<HierPath, PathError> {
        validate_segment(self.segments.len(), name)?;
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Ok(Self { segments })
    }

    /// Every proper prefix of this path, shortest first.
    pub fn ancestors(&self) -> Vec<HierPath> {
        (1..self.segments.len())
            .map(|len| Self {
                segments: self.segments[..len].to_vec(),
            })
            .collect()
    }

    pub fn starts_with(&self, prefix: &HierPath) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    pub fn encode(&self) -> FlatKey {
        FlatKey::encode(self)
    }
}

impl fmt::Display for HierPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_fs_path().display())
    }
}

/// Flat key form of a [`HierPath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FlatKey(String);

impl FlatKey {
    /// Encode a hierarchical path.
    pub fn encode(path: &HierPath) -> Self {
        let mut key = String::new();
        for (position, segment) in path.segments.iter().enumerate() {
            if position > 0 {
                key.push(DELIMITER);
            }
            for ch in segment.chars() {
                if ch == DELIMITER || ch == ESCAPE {
                    key.push(ESCAPE);
                }
                key.push(ch);
            }
        }
        Self(key)
    }

    /// Parse and validate a key received from outside.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        decode(raw).map(|path| path.encode())
    }

    pub fn from_fs_path(path: &Path) -> Result<Self, PathError> {
        HierPath::from_fs_path(path).map(|path| path.encode())
    }

    pub fn decode(&self) -> HierPath {
        // Keys are only built by `encode` or `parse`, so decoding cannot fail.
        decode(&self.0).unwrap_or_else(|_| HierPath {
            segments: vec![self.0.clone()],
        })
    }

    pub fn to_fs_path(&self) -> PathBuf {
        self.decode().to_fs_path()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(&self) -> String {
        self.decode().file_name().to_string()
    }

    pub fn parent(&self) -> Option<FlatKey> {
        self.decode().parent().map(|path| path.encode())
    }

    pub fn join(&self, name: &str) -> Result<FlatKey, PathError> {
        self.decode().join(name).map(|path| path.encode())
    }

    /// Replace the last segment.
    pub fn with_file_name(&self, name: &str) -> Result<FlatKey, PathError> {
        let path = self.decode();
        let parent = path
            .parent()
            .ok_or_else(|| PathError::NoParent(self.0.clone()))?;
        parent.join(name).map(|path| path.encode())
    }

    /// True when `self` lies strictly below `ancestor`.
    pub fn is_descendant_of(&self, ancestor: &FlatKey) -> bool {
        self.0.len() > ancestor.0.len() + 1
            && self.0.starts_with(&ancestor.0)
            && self.0[ancestor.0.len()..].starts_with(DELIMITER)
    }

    /// Move `self` from under `from` to under `to`.
    ///
    /// Returns `None` when `self` is neither `from` nor one of its descendants.
    pub fn rebase(&self, from: &FlatKey, to: &FlatKey) -> Option<FlatKey> {
        if self == from {
            return Some(to.clone());
        }
        if self.is_descendant_of(from) {
            return Some(Self(format!("{}{}", to.0, &self.0[from.0.len()..])));
        }
        None
    }
}

impl fmt::Display for FlatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for FlatKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        FlatKey::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Decode a flat key into its segments.
pub fn decode(raw: &str) -> Result<HierPath, PathError> {
    if raw.is_empty() {
        return Err(PathError::Empty);
    }

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        match ch {
            ESCAPE => match chars.next() {
                Some(next @ (DELIMITER | ESCAPE)) => current.push(next),
                _ => return Err(PathError::BadEscape(raw.to_string())),
            },
            DELIMITER => segments.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    segments.push(current);

    HierPath::new(segments)
}

/// Check a single entry name as it would appear below a directory.
pub fn validate_name(name: &str) -> Result<(), PathError> {
    validate_segment(1, name)
}

fn validate_segment(position: usize, segment: &str) -> Result<(), PathError> {
    if segment.is_empty() {
        return Err(PathError::EmptySegment(position));
    }
    if position == 0 && segment == UNIX_ANCHOR {
        return Ok(());
    }
    if segment == "." || segment == ".." {
        return Err(PathError::ReservedSegment(segment.to_string()));
    }
    if segment.contains('/') || segment.contains('\0') {
        return Err(PathError::ForbiddenCharacter(segment.to_string()));
    }
    Ok(())
}

fn os_to_string(value: &std::ffi::OsStr) -> Result<String, PathError> {
    value
        .to_str()
        .map(str::to_string)
        .ok_or_else(|| PathError::NotUtf8(value.to_string_lossy().into_owned()))
}
