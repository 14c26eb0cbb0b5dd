use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User label attached to any number of media files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: i64,
    pub name: String,
    /// Hex color such as `#ff8800`, if one was chosen.
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
}
