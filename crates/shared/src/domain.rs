use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(JobId);

/// Pipeline column a tracked application sits in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Saved,
    #[default]
    Applied,
    Interviewing,
    Offer,
    Rejected,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Saved,
        Stage::Applied,
        Stage::Interviewing,
        Stage::Offer,
        Stage::Rejected,
    ];

    pub fn as_wire(self) -> &'static str {
        match self {
            Stage::Saved => "SAVED",
            Stage::Applied => "APPLIED",
            Stage::Interviewing => "INTERVIEWING",
            Stage::Offer => "OFFER",
            Stage::Rejected => "REJECTED",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Stage::Saved => "Saved",
            Stage::Applied => "Applied",
            Stage::Interviewing => "Interviewing",
            Stage::Offer => "Offer",
            Stage::Rejected => "Rejected",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown pipeline stage '{0}'")]
pub struct UnknownStage(pub String);

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_wire().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownStage(raw.to_string()))
    }
}

/// Authenticated user as returned by `GET /users/me`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl UserProfile {
    pub fn display_name(&self) -> &str {
        self.full_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.email)
    }
}
