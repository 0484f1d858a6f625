use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Store(String),
    #[error("conflict writing {0}")]
    Conflict(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid key {name}: {reason}")]
    InvalidKey { name: String, reason: String },
    #[error("invalid encryption config: {0}")]
    InvalidConfig(String),
    #[error("{0}")]
    DataIntegrity(String),
    #[error("{0}")]
    Migration(String),
    #[error("{}", join_errors(.0))]
    Aggregate(Vec<EncryptionError>),
}

impl EncryptionError {
    /// Collapses per-resource failures into a single result: nothing, the lone
    /// error, or an aggregate.
    pub fn aggregate(mut errors: Vec<EncryptionError>) -> EncryptionResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(EncryptionError::Aggregate(errors)),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, EncryptionError::Conflict(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, EncryptionError::AlreadyExists(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EncryptionError::NotFound(_))
    }
}

fn join_errors(errors: &[EncryptionError]) -> String {
    let messages = errors
        .iter()
        .map(|err| err.to_string())
        .collect::<Vec<_>>();
    format!("[{}]", messages.join(", "))
}

pub type EncryptionResult<T> = Result<T, EncryptionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_of_nothing_is_ok() {
        assert!(EncryptionError::aggregate(Vec::new()).is_ok());
    }

    #[test]
    fn aggregate_of_one_returns_that_error() {
        let err = EncryptionError::aggregate(vec![EncryptionError::Conflict("a".into())])
            .expect_err("single error should surface");
        assert!(err.is_conflict());
    }

    #[test]
    fn aggregate_message_lists_every_error() {
        let err = EncryptionError::aggregate(vec![
            EncryptionError::Migration("configmap migration failed".into()),
            EncryptionError::NotFound("encryption-key-kms-3".into()),
        ])
        .expect_err("two errors should aggregate");
        assert_eq!(
            err.to_string(),
            "[configmap migration failed, encryption-key-kms-3 not found]"
        );
    }
}
