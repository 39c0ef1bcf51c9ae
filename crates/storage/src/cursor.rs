use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde_json::json;

use crate::{repository::RepositoryError, store::ItemKey};

/// Opaque pagination token wrapping the last key of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor(ItemKey);

impl Cursor {
    pub fn from_key(key: ItemKey) -> Self {
        Self(key)
    }

    pub fn into_key(self) -> ItemKey {
        self.0
    }

    pub fn encode(&self) -> String {
        let raw = json!({ "p": self.0.partition, "s": self.0.sort });
        URL_SAFE_NO_PAD.encode(raw.to_string())
    }

    pub fn decode(token: &str) -> Result<Self, RepositoryError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| RepositoryError::InvalidCursor)?;
        let key: ItemKey =
            serde_json::from_slice(&bytes).map_err(|_| RepositoryError::InvalidCursor)?;
        Ok(Self(key))
    }

    /// Decodes a token that must belong to `partition`.
    pub fn decode_for(token: &str, partition: &str) -> Result<Self, RepositoryError> {
        let cursor = Self::decode(token)?;
        if cursor.0.partition != partition {
            return Err(RepositoryError::InvalidCursor);
        }
        Ok(cursor)
    }
}
