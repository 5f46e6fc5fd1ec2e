use serde::{Deserialize, Serialize};

/// Task priority. Lower discriminant means more urgent; the queue serves
/// `Utmost` strictly before `High`, and `High` strictly before `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Priority {
    #[serde(rename = "utmost")]
    Utmost = 0,
    #[serde(rename = "high")]
    High = 1,
    #[default]
    #[serde(rename = "normal")]
    Normal = 2,
}

impl Priority {
    /// Priorities in dequeue order, most urgent first.
    pub const DEQUEUE_ORDER: [Priority; 3] = [Priority::Utmost, Priority::High, Priority::Normal];

    pub fn suffix(&self) -> &'static str {
        match self {
            Priority::Utmost => "utmost",
            Priority::High => "high",
            Priority::Normal => "normal",
        }
    }

    pub fn all() -> &'static [Priority] {
        &Self::DEQUEUE_ORDER
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.suffix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order() {
        assert!(Priority::Utmost < Priority::High);
        assert!(Priority::High < Priority::Normal);
    }

    #[test]
    fn test_serde_roundtrip() {
        let json = serde_json::to_string(&Priority::Utmost).unwrap();
        assert_eq!(json, "\"utmost\"");
        let back: Priority = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Priority::Utmost);
    }
}
