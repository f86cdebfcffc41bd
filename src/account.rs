//! Account snapshot records read by the aggregator.

use crate::decimal::Decimal4;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque account identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        AccountId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        AccountId::new(id)
    }
}

impl From<String> for AccountId {
    fn from(id: String) -> Self {
        AccountId(id)
    }
}

/// A point-in-time account balance.
///
/// Records are immutable once handed to the aggregator and are shared
/// read-only across worker threads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Account identifier. The `number` column name is accepted on input.
    #[serde(alias = "number")]
    pub id: AccountId,

    /// Display name of the account holder. The `name` column name is accepted on input.
    #[serde(alias = "name")]
    pub owner_name: String,

    /// Balance at snapshot time. May be negative.
    pub balance: Decimal4,
}

impl AccountRecord {
    pub fn new(id: impl Into<AccountId>, owner_name: impl Into<String>, balance: Decimal4) -> Self {
        AccountRecord {
            id: id.into(),
            owner_name: owner_name.into(),
            balance,
        }
    }
}
