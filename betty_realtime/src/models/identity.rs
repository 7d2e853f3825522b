use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Role of the signed-in user as stored in `profiles.role`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[display("customer")]
    Customer,
    #[display("sales")]
    Sales,
    #[display("admin")]
    Admin,
}

impl Role {
    pub fn is_staff(&self) -> bool { matches!(self, Self::Sales | Self::Admin) }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "customer" => Ok(Self::Customer),
            "sales" => Ok(Self::Sales),
            "admin" => Ok(Self::Admin),
            _ => bail!("Unknown role: {s}"),
        }
    }
}

/// The user on whose behalf events are filtered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub role: Role,
}

impl Identity {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    pub fn customer(id: impl Into<String>) -> Self { Self::new(id, Role::Customer) }

    pub fn sales(id: impl Into<String>) -> Self { Self::new(id, Role::Sales) }

    pub fn admin(id: impl Into<String>) -> Self { Self::new(id, Role::Admin) }
}
