use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRecord {
    pub id: String,
    pub original_url: String,
    pub short_url: String,
    pub clicks: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
}

impl LinkRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkSpecification {
    pub original_url: String,
    #[serde(default)]
    pub custom_name: Option<String>,
}

#[derive(Deserialize)]
pub struct ListParameters {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LinkSummary {
    pub total_links: usize,
    pub active_links: usize,
    pub total_clicks: u64,
    pub average_clicks: f64,
    pub top_links: Vec<LinkRecord>,
}
