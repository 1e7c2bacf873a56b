// src/types/date.rs

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A Parse date as the ISO 8601 string the server sends in `createdAt`/`updatedAt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDate {
    pub iso: String,
}

impl ParseDate {
    pub fn new(iso_string: String) -> Self {
        ParseDate { iso: iso_string }
    }

    pub fn iso(&self) -> &str {
        &self.iso
    }
}

impl<'de> Deserialize<'de> for ParseDate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Accepts both the bare string and the {"__type":"Date","iso":...} form
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Plain(String),
            Typed { iso: String },
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Plain(iso) | Repr::Typed { iso } => ParseDate { iso },
        })
    }
}

impl Serialize for ParseDate {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.iso)
    }
}
