//! Operator control operations on a table-partition

use serde::{Deserialize, Serialize};

/// Control operation addressed to one export source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlOperation {
    /// Skip the sequence gap a blocked master is waiting on. Rows in the gap
    /// are never exported.
    Release,
}

impl std::fmt::Display for ControlOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlOperation::Release => write!(f, "RELEASE"),
        }
    }
}

impl std::str::FromStr for ControlOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "RELEASE" => Ok(ControlOperation::Release),
            _ => Err(format!("Invalid control operation: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_control_operation() {
        assert_eq!("RELEASE".parse::<ControlOperation>(), Ok(ControlOperation::Release));
        assert_eq!("release".parse::<ControlOperation>(), Ok(ControlOperation::Release));
        assert!("PAUSE".parse::<ControlOperation>().is_err());
        assert_eq!(ControlOperation::Release.to_string(), "RELEASE");
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_string(&ControlOperation::Release).unwrap();
        assert_eq!(json, "\"RELEASE\"");
    }
}
