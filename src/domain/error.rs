use crate::domain::models::Role;
use thiserror::Error;

/// Failures surfaced by the session and its components.
///
/// None of these end the session; callers log them and abort only the
/// action that produced them.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClientError {
    #[error("{method} failed: {name}: {message}")]
    BusCall {
        method: String,
        name: String,
        message: String,
    },

    #[error("malformed {method} reply: {reason}")]
    MalformedReply { method: String, reason: String },

    #[error("property {role}->{name} not found")]
    PropertyNotFound { role: Role, name: String },

    #[error("property {role}->{name} has type '{found}', expected '{expected}'")]
    PropertyTypeMismatch {
        role: Role,
        name: String,
        expected: &'static str,
        found: String,
    },

    #[error("property {name} is not tracked for the {role}")]
    UnknownProperty { role: Role, name: String },

    #[error("{0} is not bound to a bus object")]
    Unbound(Role),

    #[error("{role} is bound to {interface}, expected {expected}")]
    WrongInterface {
        role: Role,
        interface: String,
        expected: &'static str,
    },

    #[error("{role} UUID does not match the configured {expected}")]
    UuidMismatch { role: Role, expected: String },

    #[error("value of type '{0}' cannot be set as a property")]
    UnsupportedValue(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("session is closed")]
    Closed,
}

impl ClientError {
    /// True when a typed read failed because the value is simply not known yet.
    pub fn is_unknown_value(&self) -> bool {
        matches!(
            self,
            Self::PropertyNotFound { .. } | Self::PropertyTypeMismatch { .. } | Self::Unbound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_role() {
        assert_eq!(
            ClientError::Unbound(Role::WriteCharacteristic).to_string(),
            "write characteristic is not bound to a bus object"
        );
        assert_eq!(
            ClientError::PropertyNotFound {
                role: Role::Controller,
                name: "Powered".into(),
            }
            .to_string(),
            "property controller->Powered not found"
        );
    }
}
