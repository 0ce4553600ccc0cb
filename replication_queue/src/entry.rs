//! Log entries and their wire codec.
//!
//! Entries live as text payloads under the shared `/log` and are mirrored
//! verbatim into each replica's `/queue`. The format is line oriented with a
//! version prefix; serialization is deterministic (the same entry always
//! produces byte-identical output, because payloads are compared across
//! replicas), and parsing ignores unknown trailing lines so newer writers
//! stay readable.

use data_types::{PartName, PartNameError};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::fmt::Write as _;

/// Version written by this codec. Payloads with an older version are
/// rejected; newer ones are read with unknown trailing lines ignored.
pub const FORMAT_VERSION: u32 = 4;

/// Errors raised when an entry payload cannot be parsed.
///
/// All of these are fatal to the replica: a queue holding an unreadable
/// entry must not start.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum EntryParseError {
    #[snafu(display("Empty entry payload"))]
    EmptyPayload,

    #[snafu(display("Entry payload does not start with a version line: '{line}'"))]
    BadVersionLine { line: String },

    #[snafu(display("Unsupported entry format version {version}"))]
    UnsupportedVersion { version: u32 },

    #[snafu(display("Cannot parse '{line}' as an entry header"))]
    BadHeaderLine { line: String },

    #[snafu(display("Unknown entry type '{action}'"))]
    UnknownEntryType { action: String },

    #[snafu(display("Entry payload ends before the '{expected}' block is complete"))]
    Truncated { expected: &'static str },

    #[snafu(display("Expected '{expected}' line, found '{found}'"))]
    UnexpectedLine {
        expected: &'static str,
        found: String,
    },

    #[snafu(display("Entry references an invalid part name: {source}"))]
    BadPartName { source: PartNameError },
}

/// The kind of replication action an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    /// Fetch a part from a peer replica.
    GetPart,
    /// Merge a run of source parts into a new covering part.
    MergeParts,
    /// Register an existing part with the shard.
    AttachPart,
    /// Remove every part in a range.
    DropRange,
    /// Rewrite a range of parts without one column.
    ClearColumn,
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::GetPart => "GET_PART",
            Self::MergeParts => "MERGE_PARTS",
            Self::AttachPart => "ATTACH_PART",
            Self::DropRange => "DROP_RANGE",
            Self::ClearColumn => "CLEAR_COLUMN",
        };
        write!(f, "{s}")
    }
}

/// One replication action, as serialized into the shared log.
///
/// Immutable by convention once created; the mutable execution bookkeeping
/// lives on [`crate::queue::QueueEntry`] instead, so this struct can be
/// compared and re-serialized freely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// What to do.
    pub entry_type: EntryType,
    /// The part this entry produces or targets.
    pub new_part_name: String,
    /// Source parts of a merge, in order. Empty for other entry types.
    pub parts_to_merge: Vec<String>,
    /// Column removed by a `ClearColumn` entry.
    pub column_name: Option<String>,
    /// Seconds since epoch, assigned when the entry was first written to the
    /// shared log. `0` means unknown and never lowers insert watermarks.
    pub create_time: i64,
    /// Replica that authored the entry.
    pub source_replica: String,
}

impl LogEntry {
    /// Render the payload written to the coordinator.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        writeln!(out, "format version: {FORMAT_VERSION}").expect("writing to String cannot fail");
        writeln!(out, "create_time: {}", self.create_time).expect("writing to String cannot fail");
        writeln!(out, "source replica: {}", self.source_replica)
            .expect("writing to String cannot fail");
        match self.entry_type {
            EntryType::GetPart => {
                writeln!(out, "get\n{}", self.new_part_name)
            }
            EntryType::MergeParts => {
                writeln!(out, "merge").expect("writing to String cannot fail");
                for part in &self.parts_to_merge {
                    writeln!(out, "{part}").expect("writing to String cannot fail");
                }
                writeln!(out, "into\n{}", self.new_part_name)
            }
            EntryType::AttachPart => {
                writeln!(out, "attach\n{}", self.new_part_name)
            }
            EntryType::DropRange => {
                writeln!(out, "drop\n{}", self.new_part_name)
            }
            EntryType::ClearColumn => {
                writeln!(
                    out,
                    "clear column\n{}\nfrom\n{}",
                    self.column_name.as_deref().unwrap_or(""),
                    self.new_part_name
                )
            }
        }
        .expect("writing to String cannot fail");
        out
    }

    /// Parse a payload read back from the coordinator.
    pub fn parse(payload: &str) -> Result<Self, EntryParseError> {
        let mut lines = payload.lines().peekable();

        let version_line = lines.next().context(EmptyPayloadSnafu)?;
        let version: u32 = version_line
            .strip_prefix("format version: ")
            .and_then(|v| v.trim().parse().ok())
            .context(BadVersionLineSnafu { line: version_line })?;
        ensure!(
            version >= FORMAT_VERSION,
            UnsupportedVersionSnafu { version }
        );

        let mut create_time = 0;
        if let Some(rest) = lines
            .peek()
            .copied()
            .and_then(|l| l.strip_prefix("create_time: "))
        {
            create_time = rest
                .trim()
                .parse()
                .ok()
                .context(BadHeaderLineSnafu { line: rest })?;
            lines.next();
        }

        let mut source_replica = String::new();
        if let Some(rest) = lines
            .peek()
            .copied()
            .and_then(|l| l.strip_prefix("source replica: "))
        {
            source_replica = rest.to_owned();
            lines.next();
        }

        let action = lines.next().context(TruncatedSnafu { expected: "action" })?;
        let entry = match action {
            "get" => Self {
                entry_type: EntryType::GetPart,
                new_part_name: part_line(&mut lines, "get")?,
                parts_to_merge: vec![],
                column_name: None,
                create_time,
                source_replica,
            },
            "merge" => {
                let mut parts_to_merge = Vec::new();
                loop {
                    let line = lines.next().context(TruncatedSnafu { expected: "merge" })?;
                    if line == "into" {
                        break;
                    }
                    line.parse::<PartName>().context(BadPartNameSnafu)?;
                    parts_to_merge.push(line.to_owned());
                }
                ensure!(
                    !parts_to_merge.is_empty(),
                    UnexpectedLineSnafu {
                        expected: "source part",
                        found: "into",
                    }
                );
                Self {
                    entry_type: EntryType::MergeParts,
                    new_part_name: part_line(&mut lines, "merge")?,
                    parts_to_merge,
                    column_name: None,
                    create_time,
                    source_replica,
                }
            }
            "attach" => Self {
                entry_type: EntryType::AttachPart,
                new_part_name: part_line(&mut lines, "attach")?,
                parts_to_merge: vec![],
                column_name: None,
                create_time,
                source_replica,
            },
            "drop" => Self {
                entry_type: EntryType::DropRange,
                new_part_name: part_line(&mut lines, "drop")?,
                parts_to_merge: vec![],
                column_name: None,
                create_time,
                source_replica,
            },
            "clear column" => {
                let column = lines
                    .next()
                    .context(TruncatedSnafu { expected: "clear column" })?;
                let from = lines
                    .next()
                    .context(TruncatedSnafu { expected: "clear column" })?;
                ensure!(
                    from == "from",
                    UnexpectedLineSnafu {
                        expected: "from",
                        found: from,
                    }
                );
                Self {
                    entry_type: EntryType::ClearColumn,
                    new_part_name: part_line(&mut lines, "clear column")?,
                    parts_to_merge: vec![],
                    column_name: Some(column.to_owned()),
                    create_time,
                    source_replica,
                }
            }
            other => {
                return UnknownEntryTypeSnafu { action: other }.fail();
            }
        };

        // Anything after the action block was written by a newer version;
        // ignore it.
        Ok(entry)
    }
}

/// Read one line and require it to be a well-formed part name. The original
/// spelling is preserved; only validity is checked here, so that later
/// in-memory bookkeeping cannot fail on a name that slipped through.
fn part_line<'a>(
    lines: &mut impl Iterator<Item = &'a str>,
    expected: &'static str,
) -> Result<String, EntryParseError> {
    let line = lines.next().context(TruncatedSnafu { expected })?;
    line.parse::<PartName>().context(BadPartNameSnafu)?;
    Ok(line.to_owned())
}
