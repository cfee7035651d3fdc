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

//! # sqlite
//!
//! Datastore implementation over SQLite (through [sqlx]).
//!
//! A single [Session] implements every component's `Backend` trait, so the daemon can open one
//! connection pool & hand out `Arc`s to it. The same type serves as a log-database backend: the
//! [DbPool](crate::db_pool::DbPool) opens one [Session] per configured target.
//!
//! All the coordination primitives in this crate rely on the datastore evaluating updates
//! atomically; concretely, on single-statement `UPDATE ... SET version = version + ? WHERE ...`
//! and `INSERT ... ON CONFLICT ... DO UPDATE` being serialized by SQLite. Nothing here takes an
//! in-process lock. Several processes (or several [Session]s in one process) may share a database
//! file; WAL journaling plus a busy timeout keeps them from tripping over one another.

use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use snafu::{prelude::*, Backtrace};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
    FromRow, QueryBuilder, Sqlite,
};
use tracing::debug;

use crate::{
    access_logs::{self, Columns},
    db_pool,
    entities::{
        AccessLog, ClusterId, DbNode, DbNodeId, IpItem, IpItemDraft, IpItemState, IpItemType,
        IpItemUpdate, IpList, ItemFilter, ItemId, ListId, LogQuery, NodeId, NodeTask, NodeTaskId,
        NodeTaskType, PolicyId, Role, ServerId, VersionLock,
    },
    ip_lists,
    node_tasks::{self, TaskRegistration},
    storage::{self, Kind},
    versions,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to connect to {url}: {source}"))]
    Connect {
        url: String,
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to apply schema statement {stmt}: {source}"))]
    Migrate {
        stmt: String,
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{url} is not a valid SQLite URL: {source}"))]
    Options {
        url: String,
        source: sqlx::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

/// Classify a driver error for the layers above
fn stor(err: sqlx::Error) -> storage::Error {
    let kind = match &err {
        sqlx::Error::Database(db) => {
            let code = db
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                .unwrap_or_default();
            if db.kind() == sqlx::error::ErrorKind::UniqueViolation {
                Kind::Conflict
            } else if db.message().contains("no such table") {
                Kind::MissingTable
            } else if matches!(code & 0xff, 5 | 6) {
                // SQLITE_BUSY & SQLITE_LOCKED, along with their extended codes
                Kind::Transient
            } else {
                Kind::Other
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => {
            Kind::Transient
        }
        _ => Kind::Other,
    };
    storage::Error::new(kind, err)
}

fn corrupt(err: crate::entities::Error) -> storage::Error {
    storage::Error::new(Kind::Other, err)
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Quote a table name for interpolation into DDL/DML; callers only ever pass names this crate
/// generated, but there's no reason to be sloppy.
fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             schema                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Control-plane tables; every statement is idempotent.
///
/// The last four tables belong to collaborators (cluster & node configuration, firewall policies,
/// log-database targets). edgeplane only reads them, but creates them so that a fresh datastore is
/// usable on its own.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS version_locks (
        name TEXT NOT NULL PRIMARY KEY,
        version INTEGER NOT NULL DEFAULT 0,
        timeout_at INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS node_tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        role TEXT NOT NULL,
        cluster_id INTEGER NOT NULL DEFAULT 0,
        node_id INTEGER NOT NULL DEFAULT 0,
        server_id INTEGER NOT NULL DEFAULT 0,
        type TEXT NOT NULL,
        unique_id TEXT NOT NULL UNIQUE,
        version INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL DEFAULT 0,
        is_done INTEGER NOT NULL DEFAULT 0,
        is_ok INTEGER NOT NULL DEFAULT 0,
        error TEXT NOT NULL DEFAULT '',
        is_notified INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS node_tasks_node ON node_tasks (role, node_id, is_done)",
    "CREATE INDEX IF NOT EXISTS node_tasks_cluster ON node_tasks (role, cluster_id, type)",
    "CREATE TABLE IF NOT EXISTS ip_lists (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        type TEXT NOT NULL DEFAULT 'black',
        is_global INTEGER NOT NULL DEFAULT 0,
        state INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE TABLE IF NOT EXISTS ip_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        list_id INTEGER NOT NULL,
        ip_from TEXT NOT NULL DEFAULT '',
        ip_to TEXT NOT NULL DEFAULT '',
        type TEXT NOT NULL DEFAULT 'ipv4',
        version INTEGER NOT NULL DEFAULT 0,
        expired_at INTEGER NOT NULL DEFAULT 0,
        state INTEGER NOT NULL DEFAULT 1,
        reason TEXT NOT NULL DEFAULT '',
        event_level TEXT NOT NULL DEFAULT '',
        source_node_id INTEGER NOT NULL DEFAULT 0,
        source_server_id INTEGER NOT NULL DEFAULT 0,
        source_policy_id INTEGER NOT NULL DEFAULT 0,
        is_read INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS ip_items_version ON ip_items (version)",
    "CREATE INDEX IF NOT EXISTS ip_items_list ON ip_items (list_id, state)",
    "CREATE INDEX IF NOT EXISTS ip_items_ip ON ip_items (ip_from, ip_to)",
    "CREATE TABLE IF NOT EXISTS node_clusters (
        id INTEGER PRIMARY KEY,
        http_firewall_policy_id INTEGER NOT NULL DEFAULT 0,
        state INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE TABLE IF NOT EXISTS nodes (
        id INTEGER PRIMARY KEY,
        cluster_id INTEGER NOT NULL,
        role TEXT NOT NULL DEFAULT 'node',
        is_on INTEGER NOT NULL DEFAULT 1,
        state INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE TABLE IF NOT EXISTS firewall_policy_ip_lists (
        policy_id INTEGER NOT NULL,
        list_id INTEGER NOT NULL,
        PRIMARY KEY (policy_id, list_id)
    )",
    "CREATE TABLE IF NOT EXISTS db_nodes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL DEFAULT '',
        url TEXT NOT NULL,
        username TEXT NOT NULL DEFAULT '',
        password TEXT NOT NULL DEFAULT '',
        is_on INTEGER NOT NULL DEFAULT 1,
        state INTEGER NOT NULL DEFAULT 1
    )",
];

/// The access-log table template; `{t}` is replaced by the (quoted) table name & `{n}` by the
/// bare name for index naming.
const LOG_TABLE_TEMPLATE: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS {t} (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        server_id INTEGER NOT NULL DEFAULT 0,
        node_id INTEGER NOT NULL DEFAULT 0,
        status INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL DEFAULT 0,
        request_id TEXT NOT NULL DEFAULT '',
        content TEXT NOT NULL DEFAULT '',
        day TEXT NOT NULL DEFAULT '',
        remote_addr TEXT NOT NULL DEFAULT '',
        domain TEXT NOT NULL DEFAULT ''
    )",
    "CREATE INDEX IF NOT EXISTS \"{n}_server\" ON {t} (server_id, id)",
    "CREATE INDEX IF NOT EXISTS \"{n}_node\" ON {t} (node_id, id)",
    "CREATE INDEX IF NOT EXISTS \"{n}_status\" ON {t} (status)",
    "CREATE INDEX IF NOT EXISTS \"{n}_created_at\" ON {t} (created_at)",
];

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Session                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An edgeplane SQLite session; a pool of connections to one database file
#[derive(Clone, Debug)]
pub struct Session {
    pool: SqlitePool,
}

impl Session {
    /// Open (creating if need be) the database at `url`, with up to `max_connections`
    /// connections.
    pub async fn open(url: &str, max_connections: u32) -> Result<Session> {
        let options = SqliteConnectOptions::from_str(url)
            .context(OptionsSnafu { url })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .context(ConnectSnafu { url })?;
        debug!("Opened {url} with up to {max_connections} connections.");
        Ok(Session { pool })
    }
    /// Ensure the control-plane schema exists
    pub async fn migrate(&self) -> Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .context(MigrateSnafu {
                    stmt: stmt.to_string(),
                })?;
        }
        Ok(())
    }
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
    pub async fn close(&self) {
        self.pool.close().await
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     collaborator writes                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

// The configuration DAOs that own these tables live elsewhere; these are the handful of writes
// operators (and tests) need to stand up a datastore.
impl Session {
    pub async fn put_cluster(
        &self,
        id: ClusterId,
        policy_id: PolicyId,
        enabled: bool,
    ) -> storage::Result<()> {
        sqlx::query(
            "INSERT INTO node_clusters (id, http_firewall_policy_id, state) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET http_firewall_policy_id = excluded.http_firewall_policy_id,
                                           state = excluded.state",
        )
        .bind(id.get())
        .bind(policy_id.get())
        .bind(enabled)
        .execute(&self.pool)
        .await
        .map_err(stor)?;
        Ok(())
    }
    pub async fn put_node(
        &self,
        id: NodeId,
        cluster_id: ClusterId,
        role: Role,
        enabled: bool,
    ) -> storage::Result<()> {
        sqlx::query(
            "INSERT INTO nodes (id, cluster_id, role, is_on, state) VALUES (?1, ?2, ?3, ?4, 1)
             ON CONFLICT(id) DO UPDATE SET cluster_id = excluded.cluster_id, role = excluded.role,
                                           is_on = excluded.is_on",
        )
        .bind(id.get())
        .bind(cluster_id.get())
        .bind(role.as_str())
        .bind(enabled)
        .execute(&self.pool)
        .await
        .map_err(stor)?;
        Ok(())
    }
    pub async fn remove_node(&self, id: NodeId) -> storage::Result<()> {
        sqlx::query("UPDATE nodes SET state = 0 WHERE id = ?1")
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(stor)?;
        Ok(())
    }
    pub async fn create_ip_list(&self, list_type: &str, is_global: bool) -> storage::Result<ListId> {
        let result = sqlx::query("INSERT INTO ip_lists (type, is_global, state) VALUES (?1, ?2, 1)")
            .bind(list_type)
            .bind(is_global)
            .execute(&self.pool)
            .await
            .map_err(stor)?;
        Ok(ListId::new(result.last_insert_rowid()))
    }
    pub async fn set_ip_list_enabled(&self, id: ListId, enabled: bool) -> storage::Result<()> {
        sqlx::query("UPDATE ip_lists SET state = ?1 WHERE id = ?2")
            .bind(enabled)
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(stor)?;
        Ok(())
    }
    pub async fn attach_ip_list(&self, policy_id: PolicyId, list_id: ListId) -> storage::Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO firewall_policy_ip_lists (policy_id, list_id) VALUES (?1, ?2)",
        )
        .bind(policy_id.get())
        .bind(list_id.get())
        .execute(&self.pool)
        .await
        .map_err(stor)?;
        Ok(())
    }
    pub async fn put_db_node(
        &self,
        name: &str,
        url: &str,
        username: &str,
        password: &SecretString,
        enabled: bool,
    ) -> storage::Result<DbNodeId> {
        let result = sqlx::query(
            "INSERT INTO db_nodes (name, url, username, password, is_on, state)
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
        )
        .bind(name)
        .bind(url)
        .bind(username)
        .bind(password.expose_secret())
        .bind(enabled)
        .execute(&self.pool)
        .await
        .map_err(stor)?;
        Ok(DbNodeId::new(result.last_insert_rowid()))
    }
    pub async fn update_db_node(
        &self,
        id: DbNodeId,
        url: &str,
        enabled: bool,
    ) -> storage::Result<()> {
        sqlx::query("UPDATE db_nodes SET url = ?1, is_on = ?2 WHERE id = ?3")
            .bind(url)
            .bind(enabled)
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(stor)?;
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         version locks                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(FromRow)]
struct LockRow {
    name: String,
    version: i64,
    timeout_at: i64,
}

impl From<LockRow> for VersionLock {
    fn from(row: LockRow) -> Self {
        VersionLock {
            key: row.name,
            version: row.version as u64,
            timeout_at: row.timeout_at,
        }
    }
}

#[async_trait]
impl versions::Backend for Session {
    async fn select_version_lock(&self, key: &str) -> storage::Result<Option<VersionLock>> {
        Ok(sqlx::query_as::<_, LockRow>(
            "SELECT name, version, timeout_at FROM version_locks WHERE name = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(stor)?
        .map(VersionLock::from))
    }
    async fn insert_version_lock(
        &self,
        key: &str,
        version: u64,
        timeout_at: i64,
    ) -> storage::Result<()> {
        sqlx::query("INSERT INTO version_locks (name, version, timeout_at) VALUES (?1, ?2, ?3)")
            .bind(key)
            .bind(version as i64)
            .bind(timeout_at)
            .execute(&self.pool)
            .await
            .map_err(stor)?;
        Ok(())
    }
    async fn advance_version(
        &self,
        key: &str,
        expected: u64,
        step: u64,
        timeout_at: Option<i64>,
    ) -> storage::Result<bool> {
        // The increment is evaluated by SQLite, & only applies if nobody else has moved the
        // version since our caller read it.
        let result = sqlx::query(
            "UPDATE version_locks SET version = version + ?1, timeout_at = COALESCE(?2, timeout_at)
             WHERE name = ?3 AND version = ?4",
        )
        .bind(step as i64)
        .bind(timeout_at)
        .bind(key)
        .bind(expected as i64)
        .execute(&self.pool)
        .await
        .map_err(stor)?;
        Ok(result.rows_affected() == 1)
    }
    async fn expire_version_lock(&self, key: &str, timeout_at: i64) -> storage::Result<()> {
        sqlx::query("UPDATE version_locks SET timeout_at = ?1 WHERE name = ?2")
            .bind(timeout_at)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(stor)?;
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           node tasks                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(FromRow)]
struct TaskRow {
    id: i64,
    role: String,
    cluster_id: i64,
    node_id: i64,
    server_id: i64,
    #[sqlx(rename = "type")]
    task_type: String,
    unique_id: String,
    version: i64,
    updated_at: i64,
    is_done: bool,
    is_ok: bool,
    error: String,
    is_notified: bool,
}

impl TryFrom<TaskRow> for NodeTask {
    type Error = storage::Error;
    fn try_from(row: TaskRow) -> StdResult<Self, Self::Error> {
        Ok(NodeTask {
            id: NodeTaskId::new(row.id),
            role: row.role.parse::<Role>().map_err(corrupt)?,
            cluster_id: ClusterId::new(row.cluster_id),
            node_id: NodeId::new(row.node_id),
            server_id: ServerId::new(row.server_id),
            task_type: row.task_type.parse::<NodeTaskType>().map_err(corrupt)?,
            unique_id: row.unique_id,
            version: row.version as u64,
            updated_at: timestamp(row.updated_at),
            is_done: row.is_done,
            is_ok: row.is_ok,
            error: row.error,
            is_notified: row.is_notified,
        })
    }
}

const TASK_COLUMNS: &str = "id, role, cluster_id, node_id, server_id, type, unique_id, version, \
                            updated_at, is_done, is_ok, error, is_notified";

fn into_tasks(rows: Vec<TaskRow>) -> storage::Result<Vec<NodeTask>> {
    rows.into_iter().map(NodeTask::try_from).collect()
}

#[async_trait]
impl node_tasks::Backend for Session {
    async fn upsert_node_task(&self, task: &TaskRegistration) -> storage::Result<()> {
        // `max()` keeps a slow writer holding an older sequence number from moving the row's
        // version backwards.
        sqlx::query(
            "INSERT INTO node_tasks (role, cluster_id, node_id, server_id, type, unique_id, version,
                                     updated_at, is_done, is_ok, error, is_notified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, 0, '', 0)
             ON CONFLICT(unique_id) DO UPDATE SET
                 cluster_id = excluded.cluster_id,
                 version = max(node_tasks.version, excluded.version),
                 updated_at = excluded.updated_at,
                 is_done = 0,
                 is_ok = 0,
                 error = '',
                 is_notified = 0",
        )
        .bind(task.role.as_str())
        .bind(task.cluster_id.get())
        .bind(task.node_id.get())
        .bind(task.server_id.get())
        .bind(task.task_type.as_str())
        .bind(task.unique_id())
        .bind(task.version as i64)
        .bind(task.updated_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(stor)?;
        Ok(())
    }
    async fn select_cluster_tasks(
        &self,
        role: Role,
        cluster_id: Option<ClusterId>,
    ) -> storage::Result<Vec<NodeTask>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {TASK_COLUMNS} FROM node_tasks WHERE node_id = 0 AND role = "
        ));
        qb.push_bind(role.as_str());
        if let Some(cluster_id) = cluster_id {
            qb.push(" AND cluster_id = ").push_bind(cluster_id.get());
        }
        qb.push(" ORDER BY version");
        into_tasks(
            qb.build_query_as::<TaskRow>()
                .fetch_all(&self.pool)
                .await
                .map_err(stor)?,
        )
    }
    async fn delete_cluster_tasks(
        &self,
        role: Role,
        cluster_id: ClusterId,
        server_id: ServerId,
        task_type: NodeTaskType,
        max_version: u64,
    ) -> storage::Result<u64> {
        Ok(sqlx::query(
            "DELETE FROM node_tasks WHERE node_id = 0 AND role = ?1 AND cluster_id = ?2
             AND server_id = ?3 AND type = ?4 AND version <= ?5",
        )
        .bind(role.as_str())
        .bind(cluster_id.get())
        .bind(server_id.get())
        .bind(task_type.as_str())
        .bind(max_version as i64)
        .execute(&self.pool)
        .await
        .map_err(stor)?
        .rows_affected())
    }
    async fn delete_node_tasks_except(
        &self,
        role: Role,
        cluster_id: ClusterId,
        server_id: ServerId,
        task_type: NodeTaskType,
        keep: &[NodeId],
    ) -> storage::Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM node_tasks WHERE node_id > 0 AND role = ");
        qb.push_bind(role.as_str())
            .push(" AND cluster_id = ")
            .push_bind(cluster_id.get())
            .push(" AND server_id = ")
            .push_bind(server_id.get())
            .push(" AND type = ")
            .push_bind(task_type.as_str());
        if !keep.is_empty() {
            qb.push(" AND node_id NOT IN (");
            let mut ids = qb.separated(", ");
            for id in keep {
                ids.push_bind(id.get());
            }
            ids.push_unseparated(")");
        }
        Ok(qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(stor)?
            .rows_affected())
    }
    async fn select_doing_node_tasks(
        &self,
        role: Role,
        node_id: NodeId,
        since_version: u64,
    ) -> storage::Result<Vec<NodeTask>> {
        into_tasks(
            sqlx::query_as::<_, TaskRow>(&format!(
                "SELECT {TASK_COLUMNS} FROM node_tasks
                 WHERE role = ?1 AND node_id = ?2 AND (is_done = 0 OR (is_done = 1 AND is_ok = 0))
                 AND version > ?3
                 ORDER BY version, id"
            ))
            .bind(role.as_str())
            .bind(node_id.get())
            .bind(since_version as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(stor)?,
        )
    }
    async fn update_node_task_done(
        &self,
        id: NodeTaskId,
        is_ok: bool,
        error: &str,
        max_version: Option<u64>,
    ) -> storage::Result<bool> {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE node_tasks SET is_done = 1, is_ok = ");
        qb.push_bind(is_ok)
            .push(", error = ")
            .push_bind(error.to_owned())
            .push(" WHERE id = ")
            .push_bind(id.get());
        if let Some(max_version) = max_version {
            qb.push(" AND version <= ").push_bind(max_version as i64);
        }
        Ok(qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(stor)?
            .rows_affected()
            == 1)
    }
    async fn select_notifying_node_tasks(
        &self,
        role: Role,
        size: usize,
    ) -> storage::Result<Vec<NodeTask>> {
        into_tasks(
            sqlx::query_as::<_, TaskRow>(&format!(
                "SELECT {TASK_COLUMNS} FROM node_tasks
                 WHERE role = ?1 AND node_id > 0 AND is_notified = 0
                 ORDER BY id LIMIT ?2"
            ))
            .bind(role.as_str())
            .bind(size as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(stor)?,
        )
    }
    async fn update_tasks_notified(&self, ids: &[NodeTaskId]) -> storage::Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE node_tasks SET is_notified = 1 WHERE id IN (");
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(id.get());
        }
        sep.push_unseparated(")");
        Ok(qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(stor)?
            .rows_affected())
    }
    async fn delete_node_tasks_for_node(&self, role: Role, node_id: NodeId) -> storage::Result<u64> {
        Ok(
            sqlx::query("DELETE FROM node_tasks WHERE role = ?1 AND node_id = ?2")
                .bind(role.as_str())
                .bind(node_id.get())
                .execute(&self.pool)
                .await
                .map_err(stor)?
                .rows_affected(),
        )
    }
    async fn delete_tasks_for_cluster(
        &self,
        role: Role,
        cluster_id: ClusterId,
    ) -> storage::Result<u64> {
        Ok(
            sqlx::query("DELETE FROM node_tasks WHERE role = ?1 AND cluster_id = ?2")
                .bind(role.as_str())
                .bind(cluster_id.get())
                .execute(&self.pool)
                .await
                .map_err(stor)?
                .rows_affected(),
        )
    }
    async fn delete_node_task(&self, id: NodeTaskId) -> storage::Result<bool> {
        Ok(sqlx::query("DELETE FROM node_tasks WHERE id = ?1")
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(stor)?
            .rows_affected()
            == 1)
    }
    async fn select_doing_cluster_ids(&self, role: Role) -> storage::Result<Vec<ClusterId>> {
        Ok(sqlx::query_scalar::<_, i64>(
            "SELECT DISTINCT cluster_id FROM node_tasks
             WHERE role = ?1 AND cluster_id > 0 AND (is_done = 0 OR (is_done = 1 AND is_ok = 0))
             ORDER BY cluster_id",
        )
        .bind(role.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(stor)?
        .into_iter()
        .map(ClusterId::new)
        .collect())
    }
    async fn count_doing_node_tasks(&self, role: Role) -> storage::Result<u64> {
        Ok(sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM node_tasks
             WHERE role = ?1 AND node_id > 0 AND (is_done = 0 OR (is_done = 1 AND is_ok = 0))",
        )
        .bind(role.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(stor)? as u64)
    }
    async fn exists_doing_node_tasks(
        &self,
        role: Role,
        exclude: &[NodeTaskType],
    ) -> storage::Result<bool> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT EXISTS (SELECT 1 FROM node_tasks WHERE node_id > 0 \
             AND (is_done = 0 OR (is_done = 1 AND is_ok = 0)) AND role = ",
        );
        qb.push_bind(role.as_str());
        if !exclude.is_empty() {
            qb.push(" AND type NOT IN (");
            let mut sep = qb.separated(", ");
            for t in exclude {
                sep.push_bind(t.as_str());
            }
            sep.push_unseparated(")");
        }
        qb.push(")");
        qb.build_query_scalar::<bool>()
            .fetch_one(&self.pool)
            .await
            .map_err(stor)
    }
}

#[async_trait]
impl node_tasks::Topology for Session {
    async fn find_enabled_node_ids(
        &self,
        role: Role,
        cluster_id: ClusterId,
    ) -> storage::Result<Vec<NodeId>> {
        Ok(sqlx::query_scalar::<_, i64>(
            "SELECT id FROM nodes WHERE cluster_id = ?1 AND role = ?2 AND is_on = 1 AND state = 1
             ORDER BY id",
        )
        .bind(cluster_id.get())
        .bind(role.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(stor)?
        .into_iter()
        .map(NodeId::new)
        .collect())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            IP lists                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(FromRow)]
struct ListRow {
    id: i64,
    #[sqlx(rename = "type")]
    list_type: String,
    is_global: bool,
    state: i64,
}

#[derive(FromRow)]
struct ItemRow {
    id: i64,
    list_id: i64,
    ip_from: String,
    ip_to: String,
    #[sqlx(rename = "type")]
    item_type: String,
    version: i64,
    expired_at: i64,
    state: i64,
    reason: String,
    event_level: String,
    source_node_id: i64,
    source_server_id: i64,
    source_policy_id: i64,
    is_read: bool,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<ItemRow> for IpItem {
    type Error = storage::Error;
    fn try_from(row: ItemRow) -> StdResult<Self, Self::Error> {
        Ok(IpItem {
            id: ItemId::new(row.id),
            list_id: ListId::new(row.list_id),
            ip_from: row.ip_from,
            ip_to: row.ip_to,
            item_type: row.item_type.parse::<IpItemType>().map_err(corrupt)?,
            version: row.version as u64,
            expired_at: row.expired_at,
            state: IpItemState::from_i64(row.state),
            reason: row.reason,
            event_level: row.event_level,
            source_node_id: NodeId::new(row.source_node_id),
            source_server_id: ServerId::new(row.source_server_id),
            source_policy_id: PolicyId::new(row.source_policy_id),
            is_read: row.is_read,
            created_at: timestamp(row.created_at),
            updated_at: timestamp(row.updated_at),
        })
    }
}

const ITEM_COLUMNS: &str = "id, list_id, ip_from, ip_to, type, version, expired_at, state, reason, \
                            event_level, source_node_id, source_server_id, source_policy_id, \
                            is_read, created_at, updated_at";

fn into_items(rows: Vec<ItemRow>) -> storage::Result<Vec<IpItem>> {
    rows.into_iter().map(IpItem::try_from).collect()
}

#[async_trait]
impl ip_lists::Backend for Session {
    async fn select_ip_list(&self, id: ListId) -> storage::Result<Option<IpList>> {
        Ok(sqlx::query_as::<_, ListRow>(
            "SELECT id, type, is_global, state FROM ip_lists WHERE id = ?1",
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(stor)?
        .map(|row| IpList {
            id: ListId::new(row.id),
            list_type: row.list_type,
            is_global: row.is_global,
            is_enabled: row.state == 1,
        }))
    }
    async fn insert_ip_item(
        &self,
        draft: &IpItemDraft,
        item_type: IpItemType,
        version: u64,
        now: i64,
    ) -> storage::Result<ItemId> {
        let result = sqlx::query(
            "INSERT INTO ip_items (list_id, ip_from, ip_to, type, version, expired_at, state, reason,
                                   event_level, source_node_id, source_server_id, source_policy_id,
                                   is_read, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?9, ?10, ?11, 0, ?12, ?12)",
        )
        .bind(draft.list_id.get())
        .bind(&draft.ip_from)
        .bind(&draft.ip_to)
        .bind(item_type.as_str())
        .bind(version as i64)
        .bind(draft.expired_at)
        .bind(&draft.reason)
        .bind(&draft.event_level)
        .bind(draft.source_node_id.get())
        .bind(draft.source_server_id.get())
        .bind(draft.source_policy_id.get())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(stor)?;
        Ok(ItemId::new(result.last_insert_rowid()))
    }
    async fn update_ip_item(
        &self,
        id: ItemId,
        update: &IpItemUpdate,
        item_type: IpItemType,
        version: u64,
        now: i64,
    ) -> storage::Result<bool> {
        Ok(sqlx::query(
            "UPDATE ip_items SET ip_from = ?1, ip_to = ?2, type = ?3, expired_at = ?4, reason = ?5,
                                 event_level = ?6, version = ?7, updated_at = ?8
             WHERE id = ?9",
        )
        .bind(&update.ip_from)
        .bind(&update.ip_to)
        .bind(item_type.as_str())
        .bind(update.expired_at)
        .bind(&update.reason)
        .bind(&update.event_level)
        .bind(version as i64)
        .bind(now)
        .bind(id.get())
        .execute(&self.pool)
        .await
        .map_err(stor)?
        .rows_affected()
            == 1)
    }
    async fn select_ip_item(&self, id: ItemId) -> storage::Result<Option<IpItem>> {
        sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM ip_items WHERE id = ?1"
        ))
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(stor)?
        .map(IpItem::try_from)
        .transpose()
    }
    async fn disable_ip_item(&self, id: ItemId, version: u64, now: i64) -> storage::Result<bool> {
        Ok(sqlx::query(
            "UPDATE ip_items SET state = 0, version = ?1, updated_at = ?2 WHERE id = ?3 AND state = 1",
        )
        .bind(version as i64)
        .bind(now)
        .bind(id.get())
        .execute(&self.pool)
        .await
        .map_err(stor)?
        .rows_affected()
            == 1)
    }
    async fn select_enabled_item_ids(
        &self,
        filter: &ItemFilter,
    ) -> storage::Result<Vec<(ItemId, ListId)>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT id, list_id FROM ip_items WHERE state = 1");
        match filter {
            ItemFilter::List(list_id) => {
                qb.push(" AND list_id = ").push_bind(list_id.get());
            }
            ItemFilter::Ip {
                list_id,
                ip_from,
                ip_to,
            } => {
                qb.push(" AND ip_from = ")
                    .push_bind(ip_from.clone())
                    .push(" AND ip_to = ")
                    .push_bind(ip_to.clone());
                if let Some(list_id) = list_id {
                    qb.push(" AND list_id = ").push_bind(list_id.get());
                }
            }
        }
        qb.push(" ORDER BY id");
        Ok(qb
            .build_query_as::<(i64, i64)>()
            .fetch_all(&self.pool)
            .await
            .map_err(stor)?
            .into_iter()
            .map(|(id, list_id)| (ItemId::new(id), ListId::new(list_id)))
            .collect())
    }
    async fn select_items_after_version(
        &self,
        since: u64,
        size: usize,
    ) -> storage::Result<Vec<IpItem>> {
        // No state filter: disabled rows are deltas too.
        into_items(
            sqlx::query_as::<_, ItemRow>(&format!(
                "SELECT {ITEM_COLUMNS} FROM ip_items WHERE version > ?1
                 ORDER BY version, id LIMIT ?2"
            ))
            .bind(since as i64)
            .bind(size as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(stor)?,
        )
    }
    async fn select_enabled_items_with_list_id(
        &self,
        list_id: ListId,
        offset: usize,
        size: usize,
    ) -> storage::Result<Vec<IpItem>> {
        into_items(
            sqlx::query_as::<_, ItemRow>(&format!(
                "SELECT {ITEM_COLUMNS} FROM ip_items WHERE list_id = ?1 AND state = 1
                 ORDER BY id DESC LIMIT ?2 OFFSET ?3"
            ))
            .bind(list_id.get())
            .bind(size as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(stor)?,
        )
    }
    async fn count_enabled_items_with_list_id(&self, list_id: ListId) -> storage::Result<u64> {
        Ok(sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM ip_items WHERE list_id = ?1 AND state = 1",
        )
        .bind(list_id.get())
        .fetch_one(&self.pool)
        .await
        .map_err(stor)? as u64)
    }
    async fn mark_items_read(&self) -> storage::Result<u64> {
        Ok(
            sqlx::query("UPDATE ip_items SET is_read = 1 WHERE is_read = 0 AND state = 1")
                .execute(&self.pool)
                .await
                .map_err(stor)?
                .rows_affected(),
        )
    }
    async fn count_unread_items(&self) -> storage::Result<u64> {
        Ok(sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM ip_items WHERE is_read = 0 AND state = 1",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(stor)? as u64)
    }
    async fn delete_stale_items(
        &self,
        disabled_before: i64,
        expired_before: i64,
    ) -> storage::Result<u64> {
        Ok(sqlx::query(
            "DELETE FROM ip_items
             WHERE (state = 0 AND updated_at < ?1) OR (expired_at > 0 AND expired_at < ?2)",
        )
        .bind(disabled_before)
        .bind(expired_before)
        .execute(&self.pool)
        .await
        .map_err(stor)?
        .rows_affected())
    }
    async fn find_enabled_cluster_ids_with_ip_list(
        &self,
        list_id: ListId,
    ) -> storage::Result<Vec<ClusterId>> {
        Ok(sqlx::query_scalar::<_, i64>(
            "SELECT c.id FROM node_clusters c JOIN ip_lists l ON l.id = ?1 AND l.state = 1
             WHERE c.state = 1 AND (l.is_global = 1 OR c.http_firewall_policy_id IN
                   (SELECT policy_id FROM firewall_policy_ip_lists WHERE list_id = ?2))
             ORDER BY c.id",
        )
        .bind(list_id.get())
        .bind(list_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(stor)?
        .into_iter()
        .map(ClusterId::new)
        .collect())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    log database operations                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(FromRow)]
struct LogRow {
    id: i64,
    server_id: i64,
    node_id: i64,
    status: i64,
    created_at: i64,
    request_id: String,
    content: String,
    remote_addr: String,
    domain: String,
}

impl From<LogRow> for AccessLog {
    fn from(row: LogRow) -> Self {
        AccessLog {
            id: row.id,
            server_id: ServerId::new(row.server_id),
            node_id: NodeId::new(row.node_id),
            status: u16::try_from(row.status).unwrap_or_default(),
            created_at: timestamp(row.created_at),
            request_id: row.request_id,
            remote_addr: row.remote_addr,
            domain: row.domain,
            content: row.content,
        }
    }
}

#[async_trait]
impl access_logs::Backend for Session {
    async fn ping(&self) -> storage::Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(stor)?;
        Ok(())
    }
    async fn list_tables(&self, prefix: &str) -> storage::Result<Vec<String>> {
        // `_` is a LIKE wildcard, so this over-matches a bit; callers parse the names anyway.
        sqlx::query_scalar::<_, String>(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE ?1 ORDER BY name",
        )
        .bind(format!("{prefix}%"))
        .fetch_all(&self.pool)
        .await
        .map_err(stor)
    }
    async fn create_log_table(&self, name: &str) -> storage::Result<()> {
        let quoted = quote(name);
        for stmt in LOG_TABLE_TEMPLATE {
            let stmt = stmt.replace("{t}", &quoted).replace("{n}", name);
            sqlx::query(&stmt)
                .execute(&self.pool)
                .await
                .map_err(stor)?;
        }
        Ok(())
    }
    async fn table_columns(&self, name: &str) -> storage::Result<Vec<String>> {
        sqlx::query_scalar::<_, String>("SELECT name FROM pragma_table_info(?1)")
            .bind(name)
            .fetch_all(&self.pool)
            .await
            .map_err(stor)
    }
    async fn add_log_column(&self, name: &str, column: &str) -> storage::Result<()> {
        let stmt = format!(
            "ALTER TABLE {} ADD COLUMN {} TEXT NOT NULL DEFAULT ''",
            quote(name),
            quote(column)
        );
        match sqlx::query(&stmt).execute(&self.pool).await {
            Ok(_) => Ok(()),
            // Someone else got there first
            Err(sqlx::Error::Database(db)) if db.message().contains("duplicate column") => Ok(()),
            Err(err) => Err(stor(err)),
        }
    }
    async fn count_rows(&self, name: &str) -> storage::Result<u64> {
        Ok(
            sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", quote(name)))
                .fetch_one(&self.pool)
                .await
                .map_err(stor)? as u64,
        )
    }
    async fn insert_access_logs(
        &self,
        table: &str,
        columns: Columns,
        logs: &[AccessLog],
    ) -> storage::Result<()> {
        let mut names = vec![
            "server_id",
            "node_id",
            "status",
            "created_at",
            "request_id",
            "content",
            "day",
        ];
        if columns.remote_addr {
            names.push("remote_addr");
        }
        if columns.domain {
            names.push("domain");
        }
        let mut tx = self.pool.begin().await.map_err(stor)?;
        for log in logs {
            let mut qb = QueryBuilder::<Sqlite>::new(format!(
                "INSERT INTO {} ({}) VALUES (",
                quote(table),
                names.join(", ")
            ));
            let mut sep = qb.separated(", ");
            sep.push_bind(log.server_id.get())
                .push_bind(log.node_id.get())
                .push_bind(log.status as i64)
                .push_bind(log.created_at.timestamp())
                .push_bind(log.request_id.clone())
                .push_bind(log.content.clone())
                .push_bind(log.day().to_string());
            if columns.remote_addr {
                sep.push_bind(log.remote_addr.clone());
            }
            if columns.domain {
                sep.push_bind(log.domain.clone());
            }
            sep.push_unseparated(")");
            qb.build().execute(&mut *tx).await.map_err(stor)?;
        }
        tx.commit().await.map_err(stor)
    }
    async fn select_access_logs(
        &self,
        table: &str,
        columns: Columns,
        query: &LogQuery,
    ) -> storage::Result<Vec<AccessLog>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT id, server_id, node_id, status, created_at, request_id, content, {}, {} \
             FROM {} WHERE 1 = 1",
            if columns.remote_addr {
                "remote_addr"
            } else {
                "'' AS remote_addr"
            },
            if columns.domain {
                "domain"
            } else {
                "'' AS domain"
            },
            quote(table)
        ));
        if let Some(server_id) = query.server_id {
            qb.push(" AND server_id = ").push_bind(server_id.get());
        }
        if let Some(node_id) = query.node_id {
            qb.push(" AND node_id = ").push_bind(node_id.get());
        }
        if query.errors_only {
            qb.push(" AND status >= 400");
        }
        qb.push(" ORDER BY id DESC LIMIT ")
            .push_bind(query.size as i64);
        Ok(qb
            .build_query_as::<LogRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(stor)?
            .into_iter()
            .map(AccessLog::from)
            .collect())
    }
    async fn drop_table(&self, name: &str) -> storage::Result<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote(name)))
            .execute(&self.pool)
            .await
            .map_err(stor)?;
        Ok(())
    }
    async fn close(&self) {
        self.pool.close().await
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       log-database targets                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(FromRow)]
struct DbNodeRow {
    id: i64,
    name: String,
    url: String,
    username: String,
    password: String,
}

#[async_trait]
impl db_pool::Targets for Session {
    async fn find_enabled_db_nodes(&self) -> storage::Result<Vec<DbNode>> {
        Ok(sqlx::query_as::<_, DbNodeRow>(
            "SELECT id, name, url, username, password FROM db_nodes
             WHERE is_on = 1 AND state = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(stor)?
        .into_iter()
        .map(|row| DbNode {
            id: DbNodeId::new(row.id),
            name: row.name,
            url: row.url,
            username: row.username,
            password: SecretString::from(row.password),
        })
        .collect())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A migrated [Session] on a fresh database file; keep the [tempfile::TempDir] alive for as
    /// long as the session is in use.
    pub async fn scratch() -> (tempfile::TempDir, Session) {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::open(&sqlite_url(&dir, "control.db"), 4)
            .await
            .unwrap();
        session.migrate().await.unwrap();
        (dir, session)
    }

    pub fn sqlite_url(dir: &tempfile::TempDir, name: &str) -> String {
        format!("sqlite://{}", dir.path().join(name).display())
    }
}

#[cfg(test)]
mod test {
    use super::{test_support::scratch, *};
    use crate::access_logs::Backend as _;
    use crate::versions::Backend as _;

    #[tokio::test]
    async fn cas_only_applies_once() {
        let (_dir, session) = scratch().await;
        session.insert_version_lock("k", 1, 0).await.unwrap();
        let err = session.insert_version_lock("k", 1, 0).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(session.advance_version("k", 1, 5, None).await.unwrap());
        assert!(!session.advance_version("k", 1, 5, None).await.unwrap());
        let lock = session.select_version_lock("k").await.unwrap().unwrap();
        assert_eq!(lock.version, 6);
    }

    #[tokio::test]
    async fn missing_tables_are_classified() {
        let (_dir, session) = scratch().await;
        let err = session.count_rows("access_logs_20260101").await.unwrap_err();
        assert!(err.is_missing_table());
        session.create_log_table("access_logs_20260101").await.unwrap();
        // Idempotent
        session.create_log_table("access_logs_20260101").await.unwrap();
        assert_eq!(session.count_rows("access_logs_20260101").await.unwrap(), 0);
        session
            .add_log_column("access_logs_20260101", "domain")
            .await
            .unwrap();
    }
}
