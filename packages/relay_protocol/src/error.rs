//! Protocol and policy errors with stable machine-readable codes.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("action `{action}` requires field `{field}`")]
    MissingField {
        action: &'static str,
        field: &'static str,
    },

    #[error("users of the same type ({category}) cannot chat with each other")]
    SameCategory { category: String },

    #[error("users of type {category} cannot start a new chat")]
    RestrictedInitiator { category: String },
}

impl ProtocolError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::MalformedFrame(_) => "malformed_frame",
            Self::MissingField { .. } => "missing_field",
            Self::SameCategory { .. } => "same_category",
            Self::RestrictedInitiator { .. } => "restricted_initiator",
        }
    }

    /// Policy violations are permission failures; everything else is a bad frame.
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            Self::SameCategory { .. } | Self::RestrictedInitiator { .. }
        )
    }
}
