use thiserror::Error;

/// Outcomes of the secret lifecycle operations that are not plain success.
///
/// The two not-found variants deliberately cover several causes each (never
/// existed, deleted, key already used) so callers cannot tell them apart.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("the encrypted secret format is invalid")]
    BadFormat,

    #[error("unable to parse the TTL, it must be a whole number of minutes")]
    BadTtl,

    #[error("unable to parse the maximum views, it must be a whole number of zero or more")]
    BadMaxViews,

    #[error("secret does not exist or has been deleted")]
    NotFoundOrDeleted,

    #[error("secret does not exist or the viewing key has already been used")]
    NotFoundOrAlreadyUsed,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SecretError {
    /// Rejected input, reported back to the caller verbatim.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::BadFormat | Self::BadTtl | Self::BadMaxViews)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFoundOrDeleted | Self::NotFoundOrAlreadyUsed)
    }
}

pub type SecretResult<T> = Result<T, SecretError>;
