use std::fmt;

use serde::{Deserialize, Serialize};

use super::constants::UNKNOWN_LABEL;

/// Result of matching a face against the enrolled identities.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Identity {
    Known(String),
    Unknown,
}

impl Identity {
    pub fn is_known(&self) -> bool {
        matches!(self, Identity::Known(_))
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Identity::Known(name) => Some(name),
            Identity::Unknown => None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name().unwrap_or(UNKNOWN_LABEL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Identity::Known("ada".into()).to_string(), "ada");
        assert_eq!(Identity::Unknown.to_string(), "unknown");
    }

    #[test]
    fn test_name_and_is_known() {
        let known = Identity::Known("ada".into());
        assert!(known.is_known());
        assert_eq!(known.name(), Some("ada"));
        assert!(!Identity::Unknown.is_known());
        assert_eq!(Identity::Unknown.name(), None);
    }
}
