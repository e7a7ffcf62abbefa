//! Database row models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionRow {
    /// Hex session id.
    pub session_id: String,
    pub my_identity: String,
    pub peer_identity: String,
    /// `FsState` display form, kept in clear for diagnostics.
    pub fs_state: String,
    /// Vault-encrypted JSON `DhSession`.
    pub state_enc: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
