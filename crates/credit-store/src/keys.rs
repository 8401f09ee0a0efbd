//! Key encoding utilities for `RocksDB`.
//!
//! This module provides functions for encoding and decoding keys used in column families.

use chrono::{DateTime, Utc};
use credit_core::{EntryId, GrantKey, UserId};

/// Create a balance key from a user ID.
#[must_use]
pub fn balance_key(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Create an entry key from an entry ID.
#[must_use]
pub fn entry_key(entry_id: &EntryId) -> Vec<u8> {
    entry_id.to_bytes().to_vec()
}

/// Create a user-entry index key.
///
/// Format: `user_id (16 bytes) || entry_id (16 bytes)`
///
/// Since ULIDs are time-ordered, entries for a user will be sorted by time.
#[must_use]
pub fn user_entry_key(user_id: &UserId, entry_id: &EntryId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&entry_id.to_bytes());
    key
}

/// Create a prefix for iterating all entries (or grants) of a user.
#[must_use]
pub fn user_prefix(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// A key that sorts after every key starting with `user_prefix(user_id)`.
///
/// Used as the seek target for newest-first iteration.
#[must_use]
pub fn user_prefix_end(user_id: &UserId) -> Vec<u8> {
    let mut key = user_prefix(user_id);
    key.extend_from_slice(&[0xff; 17]);
    key
}

/// Extract the entry ID from a user-entry index key.
///
/// Returns `None` if the key is shorter than 32 bytes.
#[must_use]
pub fn entry_id_from_user_key(key: &[u8]) -> Option<EntryId> {
    let bytes: [u8; 16] = key.get(16..32)?.try_into().ok()?;
    Some(EntryId::from_bytes(bytes))
}

/// Create a daily grant key.
///
/// Format: `user_id (16 bytes) || grant_date seconds (8 bytes, BE) || subscription_id`
///
/// The sign bit of the timestamp is flipped so that byte order matches time order.
#[must_use]
pub fn daily_grant_key(key: &GrantKey) -> Vec<u8> {
    let subscription = key.subscription_id.as_str().as_bytes();
    let mut out = Vec::with_capacity(24 + subscription.len());
    out.extend_from_slice(key.user_id.as_bytes());
    out.extend_from_slice(&sortable_seconds(key.grant_date));
    out.extend_from_slice(subscription);
    out
}

fn sortable_seconds(at: DateTime<Utc>) -> [u8; 8] {
    #[allow(clippy::cast_sign_loss)]
    let flipped = (at.timestamp() as u64) ^ (1 << 63);
    flipped.to_be_bytes()
}

/// Create a key from a string identifier (code, ticket, subscription, lock).
#[must_use]
pub fn string_key(id: &str) -> Vec<u8> {
    id.as_bytes().to_vec()
}
