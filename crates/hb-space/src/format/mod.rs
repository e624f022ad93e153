//! Interchange formats for search spaces.
//!
//! Two textual formats are supported: the line-based parameter-constraint
//! format (`.pcs`) and a JSON document (`.json`). The format is chosen from
//! the file extension.

pub mod json;
pub mod pcs;

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use hb_types::{HbResult, SpaceError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::space::SearchSpace;

/// On-disk representation of a search space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceFormat {
    #[default]
    Pcs,
    Json,
}

impl SpaceFormat {
    /// Pick the format from a file extension (`.pcs` or `.json`).
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SpaceError> {
        let path = path.as_ref();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("pcs") => Ok(Self::Pcs),
            Some(ext) if ext.eq_ignore_ascii_case("json") => Ok(Self::Json),
            _ => Err(SpaceError::UnsupportedFormat {
                path: path.display().to_string(),
            }),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Pcs => "pcs",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for SpaceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for SpaceFormat {
    type Err = SpaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "pcs" => Ok(Self::Pcs),
            "json" => Ok(Self::Json),
            _ => Err(SpaceError::UnsupportedFormat {
                path: s.to_string(),
            }),
        }
    }
}

/// Parse and validate a search space from text.
pub fn parse_space(text: &str, format: SpaceFormat) -> Result<SearchSpace, SpaceError> {
    let space = match format {
        SpaceFormat::Pcs => pcs::read(text)?,
        SpaceFormat::Json => json::read(text)?,
    };
    space.validate()?;
    Ok(space)
}

/// Load a search space file, selecting the format by extension.
pub fn read_space(path: impl AsRef<Path>) -> HbResult<SearchSpace> {
    let path = path.as_ref();
    let format = SpaceFormat::from_path(path)?;
    let text = fs::read_to_string(path)?;
    let space = parse_space(&text, format)?;
    debug!(path = %path.display(), %format, hyperparameters = space.len(), "loaded search space");
    Ok(space)
}

/// Render a search space in the given format.
pub fn write_space(space: &SearchSpace, format: SpaceFormat) -> Result<String, SpaceError> {
    match format {
        SpaceFormat::Pcs => Ok(pcs::write(space)),
        SpaceFormat::Json => json::write(space),
    }
}

/// Write a search space to `path`, selecting the format by extension.
pub fn write_space_file(space: &SearchSpace, path: impl AsRef<Path>) -> HbResult<()> {
    let path = path.as_ref();
    let format = SpaceFormat::from_path(path)?;
    fs::write(path, write_space(space, format)?)?;
    Ok(())
}

impl SearchSpace {
    pub fn serialize(&self, format: SpaceFormat) -> Result<Vec<u8>, SpaceError> {
        write_space(self, format).map(String::into_bytes)
    }

    pub fn deserialize(bytes: &[u8], format: SpaceFormat) -> Result<Self, SpaceError> {
        let text = std::str::from_utf8(bytes).map_err(|e| SpaceError::Parse {
            line: 0,
            message: format!("search space is not valid UTF-8: {e}"),
        })?;
        parse_space(text, format)
    }
}
