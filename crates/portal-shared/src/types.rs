use serde::{Deserialize, Serialize};

/// Observed link quality to a peer, best first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Excellent,
    #[default]
    Good,
    Fair,
    Poor,
}

impl NetworkQuality {
    pub const ALL: [NetworkQuality; 4] = [
        NetworkQuality::Excellent,
        NetworkQuality::Good,
        NetworkQuality::Fair,
        NetworkQuality::Poor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
        }
    }
}

impl std::fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NetworkQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "excellent" => Ok(Self::Excellent),
            "good" => Ok(Self::Good),
            "fair" => Ok(Self::Fair),
            "poor" => Ok(Self::Poor),
            other => Err(format!("unknown network quality: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_parse_roundtrip() {
        for q in NetworkQuality::ALL {
            assert_eq!(q.as_str().parse::<NetworkQuality>().unwrap(), q);
        }
        assert!("great".parse::<NetworkQuality>().is_err());
    }
}
