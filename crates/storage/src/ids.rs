use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::ensure;
use uuid::Uuid;

use super::error::{EmptyIdSnafu, StorageError, StorageResult};

// Ids are opaque strings so externally minted keys ("conv-1") and generated
// v7 uuids share one representation.
macro_rules! define_storage_id {
    ($name:ident, $id_type:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new_v7() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            pub fn parse(raw: &str) -> StorageResult<Self> {
                let trimmed = raw.trim();
                ensure!(
                    !trimmed.is_empty(),
                    EmptyIdSnafu {
                        stage: "parse-storage-id",
                        id_type: $id_type,
                    }
                );
                Ok(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value.to_string())
            }
        }

        impl FromStr for $name {
            type Err = StorageError;

            fn from_str(raw: &str) -> StorageResult<Self> {
                Self::parse(raw)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_storage_id!(ConversationId, "conversation-id");
define_storage_id!(MessageId, "message-id");
