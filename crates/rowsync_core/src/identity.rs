//! Identity records handed to the engine by the host application.

use serde::{Deserialize, Serialize};

/// The authenticated principal for a client or a server request.
///
/// The engine never authenticates on its own; the host resolves credentials
/// to an `Identity` (or to none, for anonymous access).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Stable user id.
    pub id: String,
    /// Email address, if known.
    pub email: Option<String>,
    /// Role name, if any.
    pub role: Option<String>,
}

impl Identity {
    /// Creates an identity with only an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
            role: None,
        }
    }

    /// Sets the email.
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Sets the role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Reads a field by name.
    pub fn field(&self, field: IdentityField) -> Option<&str> {
        match field {
            IdentityField::Id => Some(&self.id),
            IdentityField::Email => self.email.as_deref(),
            IdentityField::Role => self.role.as_deref(),
        }
    }
}

/// Identity fields usable as predicate operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityField {
    /// `identity.id`
    Id,
    /// `identity.email`
    Email,
    /// `identity.role`
    Role,
}
