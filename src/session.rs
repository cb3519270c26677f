//! Session data model.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which dashboard a session may reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Student,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Student => "student",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "student" => Ok(Role::Student),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Authentication state of the running client.
///
/// There is no stored `authenticated` flag: [`Session::is_authenticated`] is
/// recomputed from token presence every time.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub role: Option<Role>,
    /// Admin unique id or student id, used to scope data queries.
    pub subject_id: Option<String>,
}

impl Session {
    /// True iff both tokens are present.
    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some() && self.refresh_token.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self == &Session::default()
    }
}

// Tokens are credentials; keep them out of logs and panic messages.
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("role", &self.role)
            .field("subject_id", &self.subject_id)
            .finish()
    }
}

/// Login input. Serializes to exactly the fields the chosen role uses.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Credentials {
    Admin {
        email_or_phone: String,
        password: String,
    },
    Student {
        aadhaar_no: String,
        password: String,
    },
}

impl Credentials {
    pub fn role(&self) -> Role {
        match self {
            Credentials::Admin { .. } => Role::Admin,
            Credentials::Student { .. } => Role::Student,
        }
    }
}
