//! Typed commands and the line parser.

use serde::Serialize;
use std::fmt;
use std::time::Instant;

/// What a controller line asks the camera to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// `CAPTURE`
    Capture,
    /// `RGB`: white-light imaging.
    SwitchNormal,
    /// `UV`: fluorescence imaging.
    SwitchFluorescence,
    /// Anything else on the line.
    Unknown,
}

impl CommandKind {
    /// Map one token to a kind. Matching is case-insensitive and ignores
    /// surrounding whitespace.
    pub fn from_token(token: &str) -> Self {
        match token.trim().to_uppercase().as_str() {
            "CAPTURE" => Self::Capture,
            "UV" => Self::SwitchFluorescence,
            "RGB" => Self::SwitchNormal,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::SwitchNormal => "switch_normal",
            Self::SwitchFluorescence => "switch_fluorescence",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed controller line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    kind: CommandKind,
    raw_text: String,
    received_at: Instant,
}

impl Command {
    pub fn new(kind: CommandKind, raw_text: impl Into<String>, received_at: Instant) -> Self {
        Self {
            kind,
            raw_text: raw_text.into(),
            received_at,
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// The line exactly as it was handed to the parser.
    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }
}

/// Parse a line received now.
pub fn parse(raw: &str) -> Command {
    parse_at(raw, Instant::now())
}

/// Parse a line received at `received_at`.
pub fn parse_at(raw: &str, received_at: Instant) -> Command {
    Command::new(CommandKind::from_token(raw), raw, received_at)
}
