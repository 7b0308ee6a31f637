pub mod events;
pub mod inverter;

pub use events::*;
pub use inverter::*;

use serde::{Deserialize, Serialize};

/// Login privilege level of the SMA session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserGroup {
    User,
    Installer,
}

impl UserGroup {
    /// Value carried in the logon request.
    pub fn code(self) -> u32 {
        match self {
            UserGroup::User => 0x07,
            UserGroup::Installer => 0x0A,
        }
    }

    /// Password encoding bias byte.
    pub fn password_bias(self) -> u8 {
        match self {
            UserGroup::User => 0x88,
            UserGroup::Installer => 0xBB,
        }
    }

    /// Tag id of the localized group name.
    pub fn tag_id(self) -> u32 {
        match self {
            UserGroup::User => 861,
            UserGroup::Installer => 862,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UserGroup::User => "USER",
            UserGroup::Installer => "INSTALLER",
        }
    }
}
