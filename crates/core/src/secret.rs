// Namespace secrets
//
// Values are opaque bytes; storage back-ends keep them encrypted at rest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Secret metadata; the value is never serialized by default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretMeta {
    pub namespace: String,
    pub name: String,
    pub initialized: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
