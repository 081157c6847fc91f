use thiserror::Error;

/// Why a channel could not deliver an event.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The channel has no destination, e.g. the webhook variable is unset.
    #[error("{0} is not set")]
    MissingConfig(&'static str),

    #[error("throttled by the receiver, retry after {retry_after_secs}s")]
    Throttled { retry_after_secs: u64 },

    #[error("webhook answered {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl ChannelError {
    /// Failures that another attempt will not fix: a missing destination or
    /// a client error other than throttling.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        match self {
            Self::MissingConfig(_) => true,
            Self::Rejected { status, .. } => *status >= 400 && *status < 500,
            Self::Transport(_) | Self::Throttled { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_classification() {
        assert!(ChannelError::MissingConfig("SLACK_WEBHOOK_URL").is_permanent());
        assert!(ChannelError::Rejected {
            status: 404,
            body: "no_team".to_string()
        }
        .is_permanent());
        assert!(!ChannelError::Rejected {
            status: 503,
            body: String::new()
        }
        .is_permanent());
        assert!(!ChannelError::Throttled { retry_after_secs: 2 }.is_permanent());
    }
}
