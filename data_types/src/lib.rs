//! Shared data types: part names, log indexes and the active-part set.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use snafu::{OptionExt, Snafu};
use std::ops::Add;
use std::str::FromStr;

mod active_parts;
pub use active_parts::ActivePartSet;

/// Errors raised when a part name cannot be parsed.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum PartNameError {
    #[snafu(display(
        "Invalid part name '{name}': expected <partition>_<min_block>_<max_block>_<level>"
    ))]
    InvalidFormat { name: String },

    #[snafu(display("Invalid part name '{name}': '{field}' is not a number"))]
    InvalidNumber { name: String, field: &'static str },

    #[snafu(display("Invalid part name '{name}': min_block is greater than max_block"))]
    InvertedRange { name: String },
}

/// Identity of an immutable, range-partitioned data part.
///
/// Canonical string form is `<partition>_<min_block>_<max_block>_<level>`.
/// The partition id may itself contain underscores; the three numeric fields
/// are taken from the right.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartName {
    /// Partition the part belongs to.
    pub partition_id: String,
    /// Smallest block number covered by the part.
    pub min_block: i64,
    /// Largest block number covered by the part.
    pub max_block: i64,
    /// Merge depth; a freshly inserted part has level 0.
    pub level: u32,
}

impl PartName {
    /// Create a part name from its components.
    pub fn new(
        partition_id: impl Into<String>,
        min_block: i64,
        max_block: i64,
        level: u32,
    ) -> Self {
        Self {
            partition_id: partition_id.into(),
            min_block,
            max_block,
            level,
        }
    }

    /// Whether this part covers `other`: same partition, a block range that
    /// encloses `other`'s, and a level at least as high (identical ranges at
    /// the same level count as covering).
    pub fn contains(&self, other: &Self) -> bool {
        self.partition_id == other.partition_id
            && self.min_block <= other.min_block
            && self.max_block >= other.max_block
            && self.level >= other.level
    }
}

impl std::fmt::Display for PartName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.partition_id, self.min_block, self.max_block, self.level
        )
    }
}

impl FromStr for PartName {
    type Err = PartNameError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let mut fields = name.rsplitn(4, '_');
        let level_str = fields.next().unwrap_or("");
        let max_str = fields.next().unwrap_or("");
        let min_str = fields.next().unwrap_or("");
        let partition_id = fields.next().unwrap_or("");

        if partition_id.is_empty() || min_str.is_empty() || max_str.is_empty() || level_str.is_empty()
        {
            return InvalidFormatSnafu { name }.fail();
        }

        let min_block = min_str
            .parse()
            .ok()
            .context(InvalidNumberSnafu { name, field: "min_block" })?;
        let max_block = max_str
            .parse()
            .ok()
            .context(InvalidNumberSnafu { name, field: "max_block" })?;
        let level = level_str
            .parse()
            .ok()
            .context(InvalidNumberSnafu { name, field: "level" })?;

        if min_block > max_block {
            return InvertedRangeSnafu { name }.fail();
        }

        Ok(Self {
            partition_id: partition_id.to_owned(),
            min_block,
            max_block,
            level,
        })
    }
}

/// Zero-pad a log index to exactly 10 characters, so that lexicographic
/// ordering of node names equals numeric ordering of indexes.
pub fn pad_index(index: u64) -> String {
    format!("{index:010}")
}

/// Position in the shared replication log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogIndex(u64);

impl LogIndex {
    /// Create a new index.
    pub fn new(v: u64) -> Self {
        Self(v)
    }

    /// The raw value.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Add<u64> for LogIndex {
    type Output = Self;

    fn add(self, other: u64) -> Self {
        Self(self.0 + other)
    }
}

impl std::fmt::Display for LogIndex {
    /// Renders zero-padded, matching [`pad_index`].
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:010}", self.0)
    }
}

impl FromStr for LogIndex {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}
