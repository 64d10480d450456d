//! Classification labels.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Verdict for a classified video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Label {
    /// Authentic footage
    Real,
    /// Manipulated footage
    Fake,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Real => "REAL",
            Label::Fake => "FAKE",
        }
    }

    /// The other label.
    pub fn opposite(&self) -> Self {
        match self {
            Label::Real => Label::Fake,
            Label::Fake => Label::Real,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when a string is not a known label.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown label: {0} (expected REAL or FAKE)")]
pub struct LabelParseError(pub String);

impl FromStr for Label {
    type Err = LabelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REAL" => Ok(Label::Real),
            "FAKE" => Ok(Label::Fake),
            _ => Err(LabelParseError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Label::Fake).unwrap(), "\"FAKE\"");
        assert_eq!(serde_json::from_str::<Label>("\"REAL\"").unwrap(), Label::Real);
    }

    #[test]
    fn test_label_parse_is_case_insensitive() {
        assert_eq!("fake".parse::<Label>().unwrap(), Label::Fake);
        assert_eq!(" Real ".parse::<Label>().unwrap(), Label::Real);
        assert!("maybe".parse::<Label>().is_err());
    }

    #[test]
    fn test_opposite() {
        assert_eq!(Label::Real.opposite(), Label::Fake);
        assert_eq!(Label::Fake.opposite().opposite(), Label::Fake);
    }
}
