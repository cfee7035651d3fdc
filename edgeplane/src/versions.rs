// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of edgeplane.
//
// edgeplane is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// edgeplane is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with edgeplane.  If not,
// see <http://www.gnu.org/licenses/>.

//! # Version locks
//!
//! A "version lock" is a named row holding two things: a monotonically increasing counter, and a
//! timeout. The counter hands out sequence numbers (every IP item & node task is stamped with one,
//! so that edge nodes can ask "what changed since version N?"); the timeout makes the same row
//! usable as a coarse, self-expiring mutex ("only one controller runs the sweeper at a time").
//!
//! Many controller processes may share a datastore, so none of this can rely on in-process
//! synchronization. Instead, every mutation is a compare-and-swap evaluated by the datastore:
//!
//! ```text
//! UPDATE version_locks SET version = version + step WHERE name = ? AND version = <what I read>
//! ```
//!
//! If that touches no row, somebody else got in between my read & my write; I re-read & try
//! again (a bounded number of times, with a little jitter so that contending writers spread out).
//! Doing the arithmetic application-side (`read v; write v + step`) would lose updates under
//! exactly the conditions this exists to handle.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::Deserialize;
use snafu::{prelude::*, Backtrace};
use tracing::debug;

use crate::{
    counter_add,
    entities::VersionLock,
    metrics::{self, Instruments, Sort},
    storage,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Gave up advancing {key} after {attempts} contended attempts"))]
    Contended {
        key: String,
        attempts: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("Datastore error on version lock {key}: {source}"))]
    Storage {
        key: String,
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Advanced {key} to {expected}, but read back {found}"))]
    Unconfirmed {
        key: String,
        expected: u64,
        found: u64,
        backtrace: Backtrace,
    },
    #[snafu(display("Refusing to advance {key} by zero"))]
    ZeroStep { key: String, backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Backend                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The datastore operations needed to implement version locks
#[async_trait]
pub trait Backend {
    async fn select_version_lock(&self, key: &str) -> storage::Result<Option<VersionLock>>;
    /// Create the row for `key`; must fail with [storage::Kind::Conflict] if it already exists
    async fn insert_version_lock(
        &self,
        key: &str,
        version: u64,
        timeout_at: i64,
    ) -> storage::Result<()>;
    /// Atomically set `version = version + step` (and, if given, `timeout_at`), but only if
    /// `version` is still `expected`. Returns whether a row was updated.
    async fn advance_version(
        &self,
        key: &str,
        expected: u64,
        step: u64,
        timeout_at: Option<i64>,
    ) -> storage::Result<bool>;
    async fn expire_version_lock(&self, key: &str, timeout_at: i64) -> storage::Result<()>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         VersionLocks                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Number of compare-and-swap attempts `increase` makes before giving up
    #[serde(rename = "max-attempts")]
    pub max_attempts: usize,
    /// Number of times a busy/locked datastore call is retried before the error surfaces
    #[serde(rename = "transient-retries")]
    pub transient_retries: usize,
    /// Base delay between attempts; the actual delay is jittered up to twice this
    pub backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_attempts: 64,
            transient_retries: 3,
            backoff: Duration::from_millis(5),
        }
    }
}

inventory::submit! { metrics::Registration::new("versions.increase.contended", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("versions.lock.acquired", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("versions.lock.busy", Sort::IntegralCounter) }

/// Sequence numbers & timeout locks backed by the shared datastore
pub struct VersionLocks {
    backend: Arc<dyn Backend + Send + Sync>,
    config: Config,
    instruments: Arc<Instruments>,
}

impl VersionLocks {
    pub fn new(
        backend: Arc<dyn Backend + Send + Sync>,
        config: Config,
        instruments: Arc<Instruments>,
    ) -> VersionLocks {
        VersionLocks {
            backend,
            config,
            instruments,
        }
    }

    fn jitter(&self) -> Duration {
        let base = self.config.backoff.as_micros() as u64;
        Duration::from_micros(base + rand::thread_rng().gen_range(0..=base))
    }

    /// Run `f`, retrying transient failures
    async fn retrying<T, F, Fut>(&self, key: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = storage::Result<T>>,
    {
        let mut retries = 0;
        loop {
            match f().await {
                Err(err) if err.is_transient() && retries < self.config.transient_retries => {
                    retries += 1;
                    debug!("Transient error on {key} ({err}); retry #{retries}");
                    tokio::time::sleep(self.jitter()).await;
                }
                other => return other.context(StorageSnafu { key }),
            }
        }
    }

    async fn select(&self, key: &str) -> Result<Option<VersionLock>> {
        self.retrying(key, || self.backend.select_version_lock(key))
            .await
    }

    /// Create the row for `key`; `Ok(false)` means someone beat us to it
    async fn insert(&self, key: &str, version: u64, timeout_at: i64) -> Result<bool> {
        match self
            .retrying(key, || {
                self.backend.insert_version_lock(key, version, timeout_at)
            })
            .await
        {
            Ok(_) => Ok(true),
            Err(Error::Storage { source, .. }) if source.is_conflict() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Advance the counter named `key` by `step`, creating it if need be; returns the new value
    ///
    /// Concurrent callers on the same key each get a distinct result, and the final value reflects
    /// every step.
    pub async fn increase(&self, key: &str, step: u64) -> Result<u64> {
        ensure!(step > 0, ZeroStepSnafu { key });
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.select(key).await? {
                None => {
                    if self.insert(key, step, 0).await? {
                        return Ok(step);
                    }
                    // Created under us; go around again & CAS against what they wrote.
                }
                Some(lock) => {
                    let v = lock.version;
                    if self
                        .retrying(key, || self.backend.advance_version(key, v, step, None))
                        .await?
                    {
                        let found = self.select(key).await?.map(|l| l.version).unwrap_or(0);
                        ensure!(
                            found >= v + step,
                            UnconfirmedSnafu {
                                key,
                                expected: v + step,
                                found
                            }
                        );
                        return Ok(v + step);
                    }
                }
            }
            counter_add!(self.instruments, "versions.increase.contended", 1, &[]);
            if attempts >= self.config.max_attempts {
                return ContendedSnafu { key, attempts }.fail();
            }
            tokio::time::sleep(self.jitter()).await;
        }
    }

    /// The current value of counter `key`, if it has ever been advanced
    pub async fn read(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.select(key).await?.map(|lock| lock.version))
    }

    /// Try to take the lock named `key` for `timeout`
    ///
    /// Returns `false` (rather than an error) if somebody else holds it, or if somebody else took
    /// it over at the same moment we tried to.
    pub async fn lock(&self, key: &str, timeout: Duration) -> Result<bool> {
        let now = Utc::now().timestamp();
        let timeout_at = now + timeout.as_secs_f64().ceil() as i64;
        let current = match self.select(key).await? {
            None => {
                if self.insert(key, 1, timeout_at).await? {
                    counter_add!(self.instruments, "versions.lock.acquired", 1, &[]);
                    return Ok(true);
                }
                self.select(key).await?
            }
            some => some,
        };
        let Some(current) = current else {
            // Inserted & then gone? Nothing deletes these rows; treat it as contention.
            return Ok(false);
        };
        if current.is_held_at(now) {
            counter_add!(self.instruments, "versions.lock.busy", 1, &[]);
            return Ok(false);
        }
        let v = current.version;
        if !self
            .retrying(key, || {
                self.backend.advance_version(key, v, 1, Some(timeout_at))
            })
            .await?
        {
            counter_add!(self.instruments, "versions.lock.busy", 1, &[]);
            return Ok(false);
        }
        // The CAS landed; make sure it was *our* advance that the row now reflects.
        let acquired = self.select(key).await?.map(|l| l.version) == Some(v + 1);
        if acquired {
            counter_add!(self.instruments, "versions.lock.acquired", 1, &[]);
        } else {
            counter_add!(self.instruments, "versions.lock.busy", 1, &[]);
        }
        Ok(acquired)
    }

    /// Release the lock named `key`; the version is left alone
    pub async fn unlock(&self, key: &str) -> Result<()> {
        let past = Utc::now().timestamp() - 1;
        self.retrying(key, || self.backend.expire_version_lock(key, past))
            .await
    }
}

#[cfg(test)]
mod mock {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use super::*;
    use crate::storage::Kind;

    /// An in-memory backend that can simulate other writers & a flaky datastore
    #[derive(Default)]
    struct Meddlesome {
        rows: Mutex<HashMap<String, VersionLock>>,
        /// Number of CAS attempts on which another "writer" sneaks in first
        interfere: AtomicUsize,
        /// Number of reads that fail as though the datastore were busy
        busy: AtomicUsize,
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[async_trait]
    impl Backend for Meddlesome {
        async fn select_version_lock(&self, key: &str) -> storage::Result<Option<VersionLock>> {
            if take(&self.busy) {
                return Err(storage::Error::new(
                    Kind::Transient,
                    std::io::Error::other("database is locked"),
                ));
            }
            Ok(self.rows.lock().unwrap().get(key).cloned())
        }
        async fn insert_version_lock(
            &self,
            key: &str,
            version: u64,
            timeout_at: i64,
        ) -> storage::Result<()> {
            let mut rows = self.rows.lock().unwrap();
            if rows.contains_key(key) {
                return Err(storage::Error::new(
                    Kind::Conflict,
                    std::io::Error::other("UNIQUE constraint failed"),
                ));
            }
            rows.insert(
                key.to_owned(),
                VersionLock {
                    key: key.to_owned(),
                    version,
                    timeout_at,
                },
            );
            Ok(())
        }
        async fn advance_version(
            &self,
            key: &str,
            expected: u64,
            step: u64,
            timeout_at: Option<i64>,
        ) -> storage::Result<bool> {
            let mut rows = self.rows.lock().unwrap();
            let Some(row) = rows.get_mut(key) else {
                return Ok(false);
            };
            if take(&self.interfere) {
                row.version += 1;
            }
            if row.version != expected {
                return Ok(false);
            }
            row.version += step;
            if let Some(timeout_at) = timeout_at {
                row.timeout_at = timeout_at;
            }
            Ok(true)
        }
        async fn expire_version_lock(&self, key: &str, timeout_at: i64) -> storage::Result<()> {
            if let Some(row) = self.rows.lock().unwrap().get_mut(key) {
                row.timeout_at = timeout_at;
            }
            Ok(())
        }
    }

    fn locks(backend: Arc<Meddlesome>, max_attempts: usize) -> VersionLocks {
        VersionLocks::new(
            backend,
            Config {
                max_attempts,
                transient_retries: 2,
                backoff: Duration::from_millis(1),
            },
            Arc::new(Instruments::new("edgeplane")),
        )
    }

    #[tokio::test]
    async fn increase_survives_interleaved_writers() {
        let backend = Arc::new(Meddlesome::default());
        let locks = locks(backend.clone(), 8);
        assert_eq!(locks.increase("IP_ITEM_VERSION", 1).await.unwrap(), 1);
        backend.interfere.store(3, Ordering::SeqCst);
        // Three interlopers each advanced the counter by one before we got ours in:
        assert_eq!(locks.increase("IP_ITEM_VERSION", 10).await.unwrap(), 14);
        assert_eq!(locks.read("IP_ITEM_VERSION").await.unwrap(), Some(14));
    }

    #[tokio::test]
    async fn increase_gives_up_eventually() {
        let backend = Arc::new(Meddlesome::default());
        let locks = locks(backend.clone(), 4);
        locks.increase("k", 1).await.unwrap();
        backend.interfere.store(100, Ordering::SeqCst);
        assert!(matches!(
            locks.increase("k", 1).await,
            Err(Error::Contended { attempts: 4, .. })
        ));
    }

    #[tokio::test]
    async fn zero_steps_and_transients() {
        let backend = Arc::new(Meddlesome::default());
        let locks = locks(backend.clone(), 4);
        assert!(matches!(
            locks.increase("k", 0).await,
            Err(Error::ZeroStep { .. })
        ));
        assert_eq!(locks.read("k").await.unwrap(), None);

        backend.busy.store(2, Ordering::SeqCst);
        assert_eq!(locks.increase("k", 2).await.unwrap(), 2);

        backend.busy.store(3, Ordering::SeqCst);
        let err = locks.read("k").await.unwrap_err();
        assert!(matches!(err, Error::Storage { ref source, .. } if source.is_transient()));
    }

    #[tokio::test]
    async fn lock_and_unlock() {
        let backend = Arc::new(Meddlesome::default());
        let locks = locks(backend.clone(), 4);
        assert!(locks.lock("SWEEPER", Duration::from_secs(30)).await.unwrap());
        assert!(!locks.lock("SWEEPER", Duration::from_secs(30)).await.unwrap());
        locks.unlock("SWEEPER").await.unwrap();
        assert!(locks.lock("SWEEPER", Duration::from_secs(30)).await.unwrap());
        // Unlocking preserved the version; re-locking advanced it.
        assert_eq!(locks.read("SWEEPER").await.unwrap(), Some(2));

        // A concurrent takeover between our read & our CAS loses the race quietly
        locks.unlock("SWEEPER").await.unwrap();
        backend.interfere.store(1, Ordering::SeqCst);
        assert!(!locks.lock("SWEEPER", Duration::from_secs(30)).await.unwrap());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sqlite::test_support::scratch;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increases_sum() {
        let (_dir, session) = scratch().await;
        let locks = Arc::new(VersionLocks::new(
            Arc::new(session),
            Config::default(),
            Arc::new(Instruments::new("edgeplane")),
        ));
        let handles = (1..=16u64)
            .map(|step| {
                let locks = locks.clone();
                tokio::spawn(async move { locks.increase("NODE_TASK_VERSION", step).await })
            })
            .collect::<Vec<_>>();
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }
        results.sort();
        results.dedup();
        assert_eq!(results.len(), 16);
        assert_eq!(
            locks.read("NODE_TASK_VERSION").await.unwrap(),
            Some((1..=16).sum())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_lock_holder() {
        let (_dir, session) = scratch().await;
        let locks = Arc::new(VersionLocks::new(
            Arc::new(session),
            Config::default(),
            Arc::new(Instruments::new("edgeplane")),
        ));
        let handles = (0..8)
            .map(|_| {
                let locks = locks.clone();
                tokio::spawn(async move { locks.lock("L", Duration::from_secs(60)).await })
            })
            .collect::<Vec<_>>();
        let mut acquired = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 1);
    }
}
