use std::{
    fmt,
    str::FromStr,
};

use thiserror::Error;

/// A type representing the `<pda>/<csc>/<cp>` version triple published by the
/// FOTA server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionTriple {
    /// Primary firmware build id (`DEVICE_PDA_CODE1_VERSION`)
    pub pda: String,
    /// Carrier customization id (`DEVICE_CSC_CODE2_VERSION`)
    pub csc: String,
    /// Modem/radio build id. Some devices have no separate modem firmware.
    pub cp: Option<String>,
}

impl VersionTriple {
    pub fn new(pda: &str, csc: &str, cp: Option<&str>) -> Result<Self, ParseVersionError> {
        if pda.is_empty() {
            return Err(ParseVersionError::EmptyPda);
        } else if csc.is_empty() {
            return Err(ParseVersionError::EmptyCsc);
        }

        Ok(Self {
            pda: pda.to_owned(),
            csc: csc.to_owned(),
            cp: cp.filter(|s| !s.is_empty()).map(|s| s.to_owned()),
        })
    }

    /// The modem build id, defaulting to the PDA when there is none.
    pub fn cp_or_pda(&self) -> &str {
        self.cp.as_deref().unwrap_or(&self.pda)
    }

    /// Four-field version used in FUS requests (`DEVICE_FW_VERSION`):
    /// `<pda>/<csc>/<cp or pda>/<pda>`.
    pub fn request_version(&self) -> String {
        format!("{}/{}/{}/{}", self.pda, self.csc, self.cp_or_pda(), self.pda)
    }
}

impl fmt::Display for VersionTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.pda, self.csc, self.cp.as_deref().unwrap_or(""))
    }
}

impl FromStr for VersionTriple {
    type Err = ParseVersionError;

    /// Parse `<pda>/<csc>[/<cp>[/<data>]]`. The fourth field is accepted for
    /// compatibility with four-field versions, but is always the PDA in
    /// requests and is therefore discarded.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let pieces: Vec<&str> = s.trim().split('/').collect();

        if pieces.len() < 2 {
            return Err(ParseVersionError::TooFewFields);
        } else if pieces.len() > 4 {
            return Err(ParseVersionError::TooManyFields);
        }

        Self::new(pieces[0], pieces[1], pieces.get(2).copied())
    }
}

#[derive(Debug, Error)]
pub enum ParseVersionError {
    #[error("Too few fields (<2) in version string")]
    TooFewFields,
    #[error("Too many fields (>4) in version string")]
    TooManyFields,
    #[error("PDA field is empty")]
    EmptyPda,
    #[error("CSC field is empty")]
    EmptyCsc,
}
