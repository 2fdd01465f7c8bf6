//! Advisory resource locks.
//!
//! Mutual exclusion between workers is a Postgres advisory lock on a
//! deterministic 63-bit key. Acquisition is non-blocking: failure means
//! another worker already owns the target, and the caller skips the work
//! instead of waiting. Locks are transaction-scoped
//! (`pg_try_advisory_xact_lock`), so releasing is tied to commit/rollback
//! and a crashed worker can never leak one.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::common::utils::lock_key;

/// A deterministic advisory-lock key. Constructors are the only way to build
/// one, so the kind/ids → integer scheme has a single implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey(i64);

impl LockKey {
    /// Serializes all chapter writes for one series source.
    pub fn series_source(id: Uuid) -> Self {
        Self(lock_key("series_source", &[&id.to_string()]))
    }

    /// Serializes canonicalization decisions that may create or merge a
    /// series for one upstream entity.
    pub fn source_entity(source_name: &str, source_id: &str) -> Self {
        Self(lock_key("source_entity", &[source_name, source_id]))
    }

    /// Serializes a merge between two series. Order-insensitive: both sides
    /// derive the same key.
    pub fn merge_pair(a: Uuid, b: Uuid) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(lock_key("merge_pair", &[&lo.to_string(), &hi.to_string()]))
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

/// Try to take `key` for the duration of the transaction. Returns `false`
/// when another session holds it.
pub async fn try_advisory_xact_lock(
    tx: &mut Transaction<'_, Postgres>,
    key: LockKey,
) -> Result<bool> {
    let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
        .bind(key.as_i64())
        .fetch_one(&mut **tx)
        .await?;
    Ok(acquired)
}

/// Count how many of the given advisory keys are currently held by any
/// session. Used by the scheduler to skip targets that already have a worker
/// on them. Advisory keys surface in `pg_locks` split into two 32-bit halves.
pub async fn held_advisory_keys(
    pool: &sqlx::PgPool,
    keys: &[LockKey],
) -> Result<HashSet<i64>> {
    if keys.is_empty() {
        return Ok(HashSet::new());
    }
    let raw: Vec<i64> = keys.iter().map(|k| k.as_i64()).collect();
    let held: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT k.key
        FROM unnest($1::bigint[]) AS k(key)
        WHERE EXISTS (
            SELECT 1 FROM pg_locks
            WHERE locktype = 'advisory'
              AND classid = (k.key >> 32)::oid
              AND objid = (k.key & x'FFFFFFFF'::bigint)::oid
              AND objsubid = 1
        )
        "#,
    )
    .bind(&raw)
    .fetch_all(pool)
    .await?;
    Ok(held.into_iter().collect())
}

/// In-process lock table with the same try-acquire semantics, for tests and
/// the in-memory queue. Guards release on drop.
#[derive(Default, Clone)]
pub struct InMemoryLocks {
    held: Arc<Mutex<HashSet<i64>>>,
}

pub struct InMemoryLockGuard {
    key: i64,
    held: Arc<Mutex<HashSet<i64>>>,
}

impl InMemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, key: LockKey) -> Option<InMemoryLockGuard> {
        let mut held = self.held.lock().unwrap();
        if held.insert(key.as_i64()) {
            Some(InMemoryLockGuard {
                key: key.as_i64(),
                held: self.held.clone(),
            })
        } else {
            None
        }
    }

    pub fn is_held(&self, key: LockKey) -> bool {
        self.held.lock().unwrap().contains(&key.as_i64())
    }
}

impl Drop for InMemoryLockGuard {
    fn drop(&mut self) {
        self.held.lock().unwrap().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_pair_is_order_insensitive() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(LockKey::merge_pair(a, b), LockKey::merge_pair(b, a));
    }

    #[test]
    fn in_memory_locks_are_exclusive() {
        let locks = InMemoryLocks::new();
        let key = LockKey::series_source(Uuid::new_v4());

        let guard = locks.try_acquire(key).expect("first acquire succeeds");
        assert!(locks.try_acquire(key).is_none());

        drop(guard);
        assert!(locks.try_acquire(key).is_some());
    }

    #[test]
    fn distinct_resources_do_not_contend() {
        let locks = InMemoryLocks::new();
        let _a = locks
            .try_acquire(LockKey::series_source(Uuid::new_v4()))
            .unwrap();
        assert!(locks
            .try_acquire(LockKey::series_source(Uuid::new_v4()))
            .is_some());
    }
}
