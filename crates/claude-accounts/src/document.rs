//! The credentials document
//!
//! `accounts.json` maps account names to OAuth credentials:
//!
//! ```json
//! {
//!   "version": 1,
//!   "accounts": {
//!     "work": { "accessToken": "...", "refreshToken": "...", "expiresAt": 1735500000000 }
//!   }
//! }
//! ```
//!
//! Account order in the document defines round-robin order, so the
//! `accounts` object is parsed with a hand-written visitor that preserves
//! key order and rejects duplicate names. Unknown fields are tolerated for
//! forward compatibility.

use std::collections::HashSet;
use std::fmt;

use serde::de::{self, Deserializer, IgnoredAny, MapAccess, Visitor};
use serde::ser::{SerializeMap, SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constants::{
    ACCESS_TOKEN_PREFIX, DOCUMENT_VERSION, MAX_ACCOUNT_NAME_LEN, REFRESH_TOKEN_PREFIX,
};
use crate::error::{Error, Result};

/// One account's OAuth credentials as stored on disk.
///
/// `expires_at` is an absolute unix timestamp in milliseconds, computed at
/// persistence time from the token endpoint's `expires_in` seconds delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredentials {
    #[serde(rename = "accessToken")]
    pub access_token: String,
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: u64,
}

/// The parsed credentials document. `accounts` preserves document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountsDocument {
    pub version: u32,
    pub accounts: Vec<(String, StoredCredentials)>,
}

impl AccountsDocument {
    /// An empty version-1 document (cold start with zero accounts).
    pub fn empty() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            accounts: Vec::new(),
        }
    }

    /// Look up credentials by account name.
    pub fn get(&self, name: &str) -> Option<&StoredCredentials> {
        self.accounts
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
    }

    /// Account names in document order.
    pub fn names(&self) -> Vec<String> {
        self.accounts.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Validate the document after parsing.
    ///
    /// Hard errors: unsupported version, invalid account name, empty token,
    /// non-positive expiry. Token prefix shape is a heuristic only — a
    /// mismatch logs a warning but does not fail the load.
    pub fn validate(&self) -> Result<()> {
        if self.version != DOCUMENT_VERSION {
            return Err(Error::DocumentInvalid(format!(
                "unsupported version {} (expected {DOCUMENT_VERSION})",
                self.version
            )));
        }

        for (name, credentials) in &self.accounts {
            if !is_valid_account_name(name) {
                return Err(Error::DocumentInvalid(format!(
                    "invalid account name '{name}': must be 1-{MAX_ACCOUNT_NAME_LEN} lowercase \
                     alphanumeric characters, underscores, or hyphens"
                )));
            }
            if credentials.access_token.is_empty() {
                return Err(Error::DocumentInvalid(format!(
                    "account '{name}' has an empty access token"
                )));
            }
            if credentials.refresh_token.is_empty() {
                return Err(Error::DocumentInvalid(format!(
                    "account '{name}' has an empty refresh token"
                )));
            }
            if credentials.expires_at == 0 {
                return Err(Error::DocumentInvalid(format!(
                    "account '{name}' has a non-positive expiresAt"
                )));
            }
            if !credentials.access_token.starts_with(ACCESS_TOKEN_PREFIX) {
                warn!(account = %name, "access token does not match expected shape");
            }
            if !credentials.refresh_token.starts_with(REFRESH_TOKEN_PREFIX) {
                warn!(account = %name, "refresh token does not match expected shape");
            }
        }

        Ok(())
    }
}

/// Account names: 1-32 chars of lowercase alphanumerics, `_`, `-`.
pub fn is_valid_account_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_ACCOUNT_NAME_LEN
        && name
            .bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-'))
}

impl Serialize for AccountsDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        struct OrderedAccounts<'a>(&'a [(String, StoredCredentials)]);

        impl Serialize for OrderedAccounts<'_> {
            fn serialize<S: Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                let mut map = serializer.serialize_map(Some(self.0.len()))?;
                for (name, credentials) in self.0 {
                    map.serialize_entry(name, credentials)?;
                }
                map.end()
            }
        }

        let mut doc = serializer.serialize_struct("AccountsDocument", 2)?;
        doc.serialize_field("version", &self.version)?;
        doc.serialize_field("accounts", &OrderedAccounts(&self.accounts))?;
        doc.end()
    }
}

impl<'de> Deserialize<'de> for AccountsDocument {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct DocumentVisitor;

        impl<'de> Visitor<'de> for DocumentVisitor {
            type Value = AccountsDocument;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a credentials document object")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut version: Option<u32> = None;
                let mut accounts: Option<Vec<(String, StoredCredentials)>> = None;

                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "version" => {
                            if version.is_some() {
                                return Err(de::Error::duplicate_field("version"));
                            }
                            version = Some(map.next_value()?);
                        }
                        "accounts" => {
                            if accounts.is_some() {
                                return Err(de::Error::duplicate_field("accounts"));
                            }
                            accounts = Some(map.next_value::<OrderedAccountsDe>()?.0);
                        }
                        // Unknown top-level fields are tolerated
                        _ => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }

                Ok(AccountsDocument {
                    version: version.unwrap_or(DOCUMENT_VERSION),
                    accounts: accounts.ok_or_else(|| de::Error::missing_field("accounts"))?,
                })
            }
        }

        deserializer.deserialize_map(DocumentVisitor)
    }
}

/// Order-preserving, duplicate-rejecting deserializer for the accounts map.
struct OrderedAccountsDe(Vec<(String, StoredCredentials)>);

impl<'de> Deserialize<'de> for OrderedAccountsDe {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct AccountsVisitor;

        impl<'de> Visitor<'de> for AccountsVisitor {
            type Value = OrderedAccountsDe;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of account name to credentials")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                let mut seen: HashSet<String> = HashSet::new();

                while let Some((name, credentials)) =
                    map.next_entry::<String, StoredCredentials>()?
                {
                    if !seen.insert(name.clone()) {
                        return Err(de::Error::custom(format!(
                            "duplicate account name '{name}'"
                        )));
                    }
                    entries.push((name, credentials));
                }

                Ok(OrderedAccountsDe(entries))
            }
        }

        deserializer.deserialize_map(AccountsVisitor)
    }
}
