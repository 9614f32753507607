use serde::Deserialize;
use serde::Serialize;

/// How a campaign treats users who stop matching its segments: `static`
/// campaigns never evict an enrolled user, `dynamic` campaigns track the
/// segment predicate exactly and evict (terminating the execution).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignBehavior {
    Static,
    Dynamic,
}

impl CampaignBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "static" => Ok(Self::Static),
            "dynamic" => Ok(Self::Dynamic),
            other => Err(format!("Unknown campaign behavior: {other:?}")),
        }
    }
}
