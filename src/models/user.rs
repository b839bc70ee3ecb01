use chrono::{DateTime, Utc};

use crate::common::UserId;

/// An operator account. Credentials are managed elsewhere; the coordinator only needs the
/// identity to record experiment ownership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub approved: bool,
    pub created_at: DateTime<Utc>,
}
