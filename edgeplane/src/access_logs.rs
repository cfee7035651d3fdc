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

//! # Access logs
//!
//! Edge nodes ship HTTP access logs to the control plane in volume. They're partitioned twice:
//!
//! - by *day*: each day's logs go to their own table, `access_logs_YYYYMMDD`, which makes
//!   retention a matter of dropping whole tables
//! - by *size*: once a day's table holds `max-rows-per-table` rows, writes roll over to
//!   `access_logs_YYYYMMDD_0001`, then `_0002`, and so on
//!
//! Logs may be spread across several databases, too (see [db_pool](crate::db_pool)); each is a
//! [Shard]. Tables are created on demand, so every shard needs to know, for each day, which table
//! is currently being written & how full it is. That's the [TableManager]'s job: it caches one
//! [Definition] per (shard, day), discovering the state of things from the database on a miss.
//!
//! The row count in a [Definition] is taken with `COUNT(*)` when the table is probed & advanced
//! in-process on each write thereafter. Other controllers writing the same table aren't seen until
//! the next probe, so a table can overshoot its capacity a bit; that's fine, the capacity is a
//! housekeeping threshold rather than a hard limit.
//!
//! The cache can go stale in the other direction, too: somebody drops a table we think exists. A
//! write that fails because the table is missing throws away the cached definition, re-provisions
//! & retries exactly once.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use snafu::{prelude::*, Backtrace};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    counter_add,
    db_pool::DbPool,
    entities::{AccessLog, Day, DbNodeId, LogQuery},
    metrics::{self, Instruments, Sort},
    periodic::{Job, JobError},
    storage,
};

pub const TABLE_PREFIX: &str = "access_logs_";

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Datastore error on shard {shard} while {action}: {source}"))]
    Storage {
        shard: ShardId,
        action: &'static str,
        source: storage::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         table naming                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The name of partition `partition` of `day`'s logs; partition zero is the base table
pub fn table_name(day: Day, partition: u32) -> String {
    if partition == 0 {
        format!("{TABLE_PREFIX}{day}")
    } else {
        format!("{TABLE_PREFIX}{day}_{partition:04}")
    }
}

lazy_static! {
    static ref TABLE_NAME: Regex =
        Regex::new(r"^access_logs_([0-9]{8})(?:_([0-9]{4}))?$").unwrap(/* known good */);
}

/// The inverse of [table_name]; `None` for anything that isn't a log table
pub fn parse_table_name(name: &str) -> Option<(Day, u32)> {
    let captures = TABLE_NAME.captures(name)?;
    let day = captures.get(1)?.as_str().parse::<Day>().ok()?;
    let partition = match captures.get(2) {
        Some(m) => m.as_str().parse::<u32>().ok()?,
        None => 0,
    };
    Some((day, partition))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Backend                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Optional columns a log table may (or, if it predates them, may not) carry
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Columns {
    pub remote_addr: bool,
    pub domain: bool,
}

impl Columns {
    pub fn all() -> Columns {
        Columns {
            remote_addr: true,
            domain: true,
        }
    }
}

/// Operations on a log database
#[async_trait]
pub trait Backend {
    async fn ping(&self) -> storage::Result<()>;
    /// Names of every table beginning with `prefix`
    async fn list_tables(&self, prefix: &str) -> storage::Result<Vec<String>>;
    /// Create a log table with the full column set & indexes; a no-op if it exists
    async fn create_log_table(&self, name: &str) -> storage::Result<()>;
    async fn table_columns(&self, name: &str) -> storage::Result<Vec<String>>;
    /// Add a text column; succeeds if the column is already present
    async fn add_log_column(&self, name: &str, column: &str) -> storage::Result<()>;
    async fn count_rows(&self, name: &str) -> storage::Result<u64>;
    async fn insert_access_logs(
        &self,
        table: &str,
        columns: Columns,
        logs: &[AccessLog],
    ) -> storage::Result<()>;
    /// Logs matching `query`'s filters, newest first
    async fn select_access_logs(
        &self,
        table: &str,
        columns: Columns,
        query: &LogQuery,
    ) -> storage::Result<Vec<AccessLog>>;
    async fn drop_table(&self, name: &str) -> storage::Result<()>;
    async fn close(&self);
}

/// Identifies a log database
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ShardId {
    /// The control-plane datastore itself, used when no log database is available
    Default,
    Node(DbNodeId),
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardId::Default => write!(f, "default"),
            ShardId::Node(id) => write!(f, "db-node-{id}"),
        }
    }
}

/// A log database & its identity
#[derive(Clone)]
pub struct Shard {
    pub id: ShardId,
    pub backend: Arc<dyn Backend + Send + Sync>,
}

impl Shard {
    pub fn new(id: ShardId, backend: Arc<dyn Backend + Send + Sync>) -> Shard {
        Shard { id, backend }
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard").field("id", &self.id).finish()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          TableManager                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// What's known about the table currently receiving a day's logs on one shard
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Definition {
    pub name: String,
    pub day: Day,
    pub partition: u32,
    pub exists: bool,
    pub columns: Columns,
    pub rows: u64,
}

inventory::submit! { metrics::Registration::new("access_logs.tables.created", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("access_logs.tables.probed", Sort::IntegralCounter) }

/// Routes writes to per-day, size-capped log tables, caching what it learns
pub struct TableManager {
    max_rows: u64,
    cache: RwLock<HashMap<(ShardId, Day), Definition>>,
    instruments: Arc<Instruments>,
}

impl TableManager {
    pub fn new(max_rows: u64, instruments: Arc<Instruments>) -> TableManager {
        TableManager {
            max_rows: max_rows.max(1),
            cache: RwLock::new(HashMap::new()),
            instruments,
        }
    }

    pub fn max_rows(&self) -> u64 {
        self.max_rows
    }

    /// Every partition of `day`'s logs on `shard`, as (partition, name), in partition order
    async fn day_tables(&self, shard: &Shard, day: Day) -> Result<Vec<(u32, String)>> {
        let mut tables = shard
            .backend
            .list_tables(&table_name(day, 0))
            .await
            .context(StorageSnafu {
                shard: shard.id,
                action: "listing tables",
            })?
            .into_iter()
            .filter_map(|name| match parse_table_name(&name) {
                Some((d, partition)) if d == day => Some((partition, name)),
                _ => None,
            })
            .collect::<Vec<_>>();
        tables.sort();
        Ok(tables)
    }

    async fn create(&self, shard: &Shard, name: &str) -> Result<()> {
        shard
            .backend
            .create_log_table(name)
            .await
            .context(StorageSnafu {
                shard: shard.id,
                action: "creating a log table",
            })?;
        info!("Created log table {name} on shard {}", shard.id);
        counter_add!(self.instruments, "access_logs.tables.created", 1, &[]);
        Ok(())
    }

    /// Work out the state of `day`'s last table on `shard` from the database, creating the base
    /// table if there's nothing there yet
    async fn probe(&self, shard: &Shard, day: Day) -> Result<Definition> {
        counter_add!(self.instruments, "access_logs.tables.probed", 1, &[]);
        let (partition, name) = match self.day_tables(shard, day).await?.pop() {
            Some(last) => last,
            None => {
                let name = table_name(day, 0);
                self.create(shard, &name).await?;
                (0, name)
            }
        };
        let present = shard
            .backend
            .table_columns(&name)
            .await
            .context(StorageSnafu {
                shard: shard.id,
                action: "reading table columns",
            })?;
        for column in ["remote_addr", "domain"] {
            if !present.iter().any(|c| c == column) {
                debug!("Adding column {column} to {name}");
                shard
                    .backend
                    .add_log_column(&name, column)
                    .await
                    .context(StorageSnafu {
                        shard: shard.id,
                        action: "adding a column",
                    })?;
            }
        }
        let rows = shard
            .backend
            .count_rows(&name)
            .await
            .context(StorageSnafu {
                shard: shard.id,
                action: "counting rows",
            })?;
        Ok(Definition {
            name,
            day,
            partition,
            exists: true,
            columns: Columns::all(),
            rows,
        })
    }

    /// The last table for `day` on `shard`, from the cache unless `force` is set (or there's
    /// nothing cached)
    pub async fn find_last_table(&self, shard: &Shard, day: Day, force: bool) -> Result<Definition> {
        if !force {
            if let Some(def) = self.cache.read().await.get(&(shard.id, day)) {
                return Ok(def.clone());
            }
        }
        let def = self.probe(shard, day).await?;
        self.cache
            .write()
            .await
            .insert((shard.id, day), def.clone());
        Ok(def)
    }

    /// The table to which `day`'s next writes on `shard` should go; rolls over to a new partition
    /// if the last one is full
    pub async fn route(&self, shard: &Shard, day: Day) -> Result<Definition> {
        let mut def = self.find_last_table(shard, day, false).await?;
        while def.rows >= self.max_rows {
            self.create(shard, &table_name(day, def.partition + 1))
                .await?;
            // Re-probe rather than assume: another controller may have rolled over too.
            def = self.find_last_table(shard, day, true).await?;
        }
        Ok(def)
    }

    /// Record that `n` rows were written to `table`
    pub async fn note_written(&self, shard: ShardId, day: Day, table: &str, n: u64) {
        if let Some(def) = self.cache.write().await.get_mut(&(shard, day)) {
            if def.name == table {
                def.rows += n;
            }
        }
    }

    /// Every table holding `day`'s logs on `shard`, in partition order; never creates anything
    pub async fn find_tables(&self, shard: &Shard, day: Day) -> Result<Vec<String>> {
        Ok(self
            .day_tables(shard, day)
            .await?
            .into_iter()
            .map(|(_, name)| name)
            .collect())
    }

    pub async fn reset_table(&self, shard: ShardId, day: Day) {
        self.cache.write().await.remove(&(shard, day));
    }

    pub async fn reset_shard(&self, shard: ShardId) {
        self.cache.write().await.retain(|(id, _), _| *id != shard);
    }

    pub async fn reset_all(&self) {
        self.cache.write().await.clear();
    }

    /// Forget everything cached for days before `day`
    pub async fn purge_before(&self, day: Day) {
        self.cache.write().await.retain(|(_, d), _| *d >= day);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           AccessLogs                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(rename = "max-rows-per-table")]
    pub max_rows_per_table: u64,
    /// Days of logs to keep; zero keeps everything
    #[serde(rename = "retention-days")]
    pub retention_days: u64,
    #[serde(rename = "janitor-interval")]
    pub janitor_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_rows_per_table: 10_000_000,
            retention_days: 14,
            janitor_interval: Duration::from_secs(3600),
        }
    }
}

inventory::submit! { metrics::Registration::new("access_logs.written", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("access_logs.retried", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("access_logs.tables.dropped", Sort::IntegralCounter) }

/// Writes & reads access logs across the available shards
pub struct AccessLogs {
    default: Shard,
    pool: Option<Arc<DbPool>>,
    tables: Arc<TableManager>,
    config: Config,
    instruments: Arc<Instruments>,
}

impl AccessLogs {
    pub fn new(
        default: Shard,
        pool: Option<Arc<DbPool>>,
        tables: Arc<TableManager>,
        config: Config,
        instruments: Arc<Instruments>,
    ) -> AccessLogs {
        AccessLogs {
            default,
            pool,
            tables,
            config,
            instruments,
        }
    }

    pub fn tables(&self) -> &Arc<TableManager> {
        &self.tables
    }

    async fn pick(&self) -> Shard {
        match &self.pool {
            Some(pool) => pool.pick().await.unwrap_or_else(|| self.default.clone()),
            None => self.default.clone(),
        }
    }

    async fn shards(&self) -> Vec<Shard> {
        let mut shards = vec![self.default.clone()];
        if let Some(pool) = &self.pool {
            shards.extend(pool.live().await);
        }
        shards
    }

    async fn insert(&self, shard: &Shard, def: &Definition, logs: &[AccessLog]) -> storage::Result<()> {
        shard
            .backend
            .insert_access_logs(&def.name, def.columns, logs)
            .await
    }

    /// Write one day's logs to `shard`, chunked so as not to overrun a table's capacity
    async fn write_day(&self, shard: &Shard, day: Day, logs: &[AccessLog]) -> Result<()> {
        let mut rest = logs;
        while !rest.is_empty() {
            let mut def = self.tables.route(shard, day).await?;
            let room = (self.tables.max_rows() - def.rows).min(rest.len() as u64) as usize;
            let (chunk, tail) = rest.split_at(room.max(1));
            if let Err(err) = self.insert(shard, &def, chunk).await {
                if !err.is_missing_table() {
                    return Err(err).context(StorageSnafu {
                        shard: shard.id,
                        action: "writing logs",
                    });
                }
                warn!("Log table {} vanished; re-provisioning", def.name);
                counter_add!(self.instruments, "access_logs.retried", 1, &[]);
                self.tables.reset_table(shard.id, day).await;
                def = self.tables.route(shard, day).await?;
                self.insert(shard, &def, chunk).await.context(StorageSnafu {
                    shard: shard.id,
                    action: "writing logs",
                })?;
            }
            self.tables
                .note_written(shard.id, day, &def.name, chunk.len() as u64)
                .await;
            counter_add!(self.instruments, "access_logs.written", chunk.len() as u64, &[]);
            rest = tail;
        }
        Ok(())
    }

    /// Store a batch of logs; they're grouped by day & each day's logs sent to one shard
    pub async fn create_access_logs(&self, logs: &[AccessLog]) -> Result<usize> {
        let mut by_day: BTreeMap<Day, Vec<AccessLog>> = BTreeMap::new();
        for log in logs {
            by_day.entry(log.day()).or_default().push(log.clone());
        }
        for (day, logs) in by_day {
            let shard = self.pick().await;
            self.write_day(&shard, day, &logs).await?;
        }
        Ok(logs.len())
    }

    async fn read_shard(&self, shard: &Shard, query: &LogQuery) -> Result<Vec<AccessLog>> {
        let mut found = Vec::new();
        for table in self.tables.find_tables(shard, query.day).await? {
            let columns = match shard.backend.table_columns(&table).await {
                Ok(present) => Columns {
                    remote_addr: present.iter().any(|c| c == "remote_addr"),
                    domain: present.iter().any(|c| c == "domain"),
                },
                Err(err) if err.is_missing_table() => continue,
                Err(err) => {
                    return Err(err).context(StorageSnafu {
                        shard: shard.id,
                        action: "reading table columns",
                    })
                }
            };
            match shard
                .backend
                .select_access_logs(&table, columns, query)
                .await
            {
                Ok(logs) => found.extend(logs),
                // Dropped since we listed it
                Err(err) if err.is_missing_table() => continue,
                Err(err) => {
                    return Err(err).context(StorageSnafu {
                        shard: shard.id,
                        action: "reading logs",
                    })
                }
            }
        }
        Ok(found)
    }

    /// Read back a day's logs across every shard, newest first
    pub async fn list_access_logs(&self, query: &LogQuery) -> Result<Vec<AccessLog>> {
        let shards = self.shards().await;
        let mut reads = shards
            .iter()
            .map(|shard| self.read_shard(shard, query))
            .collect::<FuturesUnordered<_>>();
        let mut found = Vec::new();
        while let Some(logs) = reads.next().await {
            found.extend(logs?);
        }
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        found.truncate(query.size);
        Ok(found)
    }

    /// Drop every log table for days before `day`, on every shard; returns the number dropped
    pub async fn drop_tables_before(&self, day: Day) -> Result<usize> {
        let mut dropped = 0;
        for shard in self.shards().await {
            let names = shard
                .backend
                .list_tables(TABLE_PREFIX)
                .await
                .context(StorageSnafu {
                    shard: shard.id,
                    action: "listing tables",
                })?;
            for name in names {
                if !matches!(parse_table_name(&name), Some((d, _)) if d < day) {
                    continue;
                }
                shard
                    .backend
                    .drop_table(&name)
                    .await
                    .context(StorageSnafu {
                        shard: shard.id,
                        action: "dropping a table",
                    })?;
                debug!("Dropped {name} on shard {}", shard.id);
                dropped += 1;
            }
        }
        self.tables.purge_before(day).await;
        counter_add!(
            self.instruments,
            "access_logs.tables.dropped",
            dropped as u64,
            &[]
        );
        Ok(dropped)
    }
}

/// [Job] enforcing log retention
pub struct Janitor {
    logs: Arc<AccessLogs>,
}

impl Janitor {
    pub fn new(logs: Arc<AccessLogs>) -> Janitor {
        Janitor { logs }
    }
}

#[async_trait]
impl Job for Janitor {
    fn name(&self) -> &'static str {
        "access-logs-janitor"
    }
    async fn tick(&self) -> std::result::Result<(), JobError> {
        let days = self.logs.config.retention_days;
        if days == 0 {
            return Ok(());
        }
        let Some(cutoff) = Day::today().minus_days(days) else {
            warn!("Retention period of {days} days is out of range; keeping all logs");
            return Ok(());
        };
        let n = self.logs.drop_tables_before(cutoff).await?;
        if n > 0 {
            info!("Dropped {n} expired log tables");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use chrono::{NaiveDate, TimeZone, Utc};

    use super::*;
    use crate::{
        entities::{NodeId, ServerId},
        sqlite::test_support::scratch,
    };

    fn day(y: i32, m: u32, d: u32) -> Day {
        Day::new(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    fn log(day: Day, status: u16) -> AccessLog {
        AccessLog {
            id: 0,
            server_id: ServerId::new(1),
            node_id: NodeId::new(2),
            status,
            created_at: Utc.from_utc_datetime(&day.date().and_hms_opt(12, 0, 0).unwrap()),
            request_id: "r".to_owned(),
            remote_addr: "192.0.2.1".to_owned(),
            domain: "example.com".to_owned(),
            content: "{}".to_owned(),
        }
    }

    #[test]
    fn names() {
        let d = day(2026, 10, 19);
        assert_eq!(table_name(d, 0), "access_logs_20261019");
        assert_eq!(table_name(d, 12), "access_logs_20261019_0012");
        assert_eq!(
            parse_table_name("access_logs_20261019_0012"),
            Some((d, 12))
        );
        assert_eq!(parse_table_name("access_logs_20261019"), Some((d, 0)));
        assert_eq!(parse_table_name("access_logs_2026101"), None);
        assert_eq!(parse_table_name("access_logs_20261019_12"), None);
        assert_eq!(parse_table_name("node_tasks"), None);
    }

    #[tokio::test]
    async fn rollover_and_retention() {
        let (_dir, session) = scratch().await;
        let instruments = Arc::new(Instruments::new("edgeplane"));
        let tables = Arc::new(TableManager::new(2, instruments.clone()));
        let logs = AccessLogs::new(
            Shard::new(ShardId::Default, Arc::new(session.clone())),
            None,
            tables.clone(),
            Config::default(),
            instruments,
        );
        let d = day(2026, 10, 19);
        // One batch of three splits across the base table & a partial
        logs.create_access_logs(&[log(d, 200), log(d, 404), log(d, 502)])
            .await
            .unwrap();
        let shard = Shard::new(ShardId::Default, Arc::new(session.clone()));
        assert_eq!(
            tables.find_tables(&shard, d).await.unwrap(),
            vec![
                "access_logs_20261019".to_owned(),
                "access_logs_20261019_0001".to_owned()
            ]
        );
        let mut query = LogQuery::new(d, 10);
        assert_eq!(logs.list_access_logs(&query).await.unwrap().len(), 3);
        query.errors_only = true;
        assert_eq!(logs.list_access_logs(&query).await.unwrap().len(), 2);

        let older = day(2026, 10, 1);
        logs.create_access_logs(&[log(older, 200)]).await.unwrap();
        assert_eq!(logs.drop_tables_before(d).await.unwrap(), 1);
        assert!(tables.find_tables(&shard, older).await.unwrap().is_empty());
        assert_eq!(tables.find_tables(&shard, d).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn janitor_tolerates_huge_retention_periods() {
        let (_dir, session) = scratch().await;
        let instruments = Arc::new(Instruments::new("edgeplane"));
        let tables = Arc::new(TableManager::new(10, instruments.clone()));
        let logs = Arc::new(AccessLogs::new(
            Shard::new(ShardId::Default, Arc::new(session.clone())),
            None,
            tables.clone(),
            Config {
                retention_days: 100_000_000,
                ..Config::default()
            },
            instruments,
        ));
        let old = day(2001, 1, 1);
        logs.create_access_logs(&[log(old, 200)]).await.unwrap();

        let janitor = Janitor::new(logs.clone());
        janitor.tick().await.unwrap();
        // Nothing is old enough to go
        let shard = Shard::new(ShardId::Default, Arc::new(session.clone()));
        assert_eq!(tables.find_tables(&shard, old).await.unwrap().len(), 1);
    }
}
