use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("store request failed: {0}")]
    Store(#[from] kube::Error),

    #[error("{kind} '{namespace}/{name}' is controlled by another owner (uid {owner_uid})")]
    OwnershipViolation {
        kind: String,
        namespace: String,
        name: String,
        owner_uid: String,
    },

    #[error("malformed cron expression '{expr}': {reason}")]
    MalformedCron { expr: String, reason: String },

    #[error("{kind} '{name}' has no uid and cannot own objects")]
    MissingUid { kind: String, name: String },

    #[error("unable to (de)serialize object: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Retrying cannot fix these without someone changing the cluster.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::OwnershipViolation { .. } | Error::MissingUid { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
