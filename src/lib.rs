#![doc = include_str!("../README.md")]

use core::fmt::{self, Display};

pub mod buffer;
pub mod capsule;
pub mod decompress;
pub mod depex;
pub mod ffs;
pub mod guid;
pub mod ifd;
pub mod parser;
pub mod pe;
pub mod region;
pub mod tree;

#[cfg(test)]
mod testimg;

pub use parser::FfsParser;

// An empty byte in a NOR flash is all-1's.
pub const EMPTY: u8 = 0xff;

/// Reasons a sub-tree could not be decoded at all.
///
/// These never escape [`FfsParser::parse`]; the caller of a failing decoder
/// records them as diagnostics and carries on with the siblings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseError {
    Truncated(String),
    InvalidVolume(String),
    InvalidFile(String),
    InvalidSection(String),
    VolumesNotFound,
}

impl Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Truncated(m) => write!(f, "truncated: {m}"),
            ParseError::InvalidVolume(m) => write!(f, "invalid volume: {m}"),
            ParseError::InvalidFile(m) => write!(f, "invalid file: {m}"),
            ParseError::InvalidSection(m) => write!(f, "invalid section: {m}"),
            ParseError::VolumesNotFound => write!(f, "no volumes found"),
        }
    }
}

/// Outcome of a parse session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseStatus {
    /// Decoded without a single diagnostic
    Success,
    /// Decoded, but diagnostics were recorded
    PartiallyParsed,
    /// Neither a capsule, a flash descriptor nor a volume was found
    SignatureNotFound,
    /// Nothing to decode
    Fatal(String),
}

impl Display for ParseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseStatus::Success => write!(f, "success"),
            ParseStatus::PartiallyParsed => write!(f, "partially parsed"),
            ParseStatus::SignatureNotFound => write!(f, "no known signature found"),
            ParseStatus::Fatal(m) => write!(f, "fatal: {m}"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ParserConfig {
    /// Shortest uniform run that is classified as free space or empty padding
    pub min_uniform_run: usize,
    /// Deepest tree level at which nested content is still decoded
    pub max_depth: usize,
    /// Upper bound for the output of a single decompression
    pub max_decompressed_size: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            min_uniform_run: 1,
            max_depth: 64,
            max_decompressed_size: 64 * 1024 * 1024,
        }
    }
}
