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

//! # The edgeplane Integration Tests
//!
//! The unit tests in each edgeplane module exercise one component against one connection pool.
//! What they can't show is the property edgeplane exists to provide: any number of controller
//! instances, sharing nothing but a datastore, stay correct when they run at the same time.
//!
//! These tests stand up a [Fixture]: a fresh, migrated datastore in a temporary directory plus a
//! fully-wired [Controller] on top of it. A test that needs a second controller asks for a
//! [peer](Fixture::peer): a separately-opened connection pool with its own components, exactly as
//! a second `edgeplaned` would have.
//!
//! # Project Structure
//!
//! The crate produces a library (this one) holding the test bodies, and an integration test program
//! per backend (`tests/sqlite.rs`, with `harness = false`) that registers them with a custom
//! [libtest-mimic] harness. Framework plumbing (the `Test` struct)
//! lives in `tests/common`.
//!
//! [libtest-mimic]: https://docs.rs/libtest-mimic/latest/libtest_mimic/index.html
use std::sync::Arc;

use edgeplane::{
    access_logs::{AccessLogs, Shard, ShardId, TableManager},
    db_pool::{DbPool, SqliteConnector},
    ip_lists::IpLists,
    metrics::Instruments,
    node_tasks::NodeTasks,
    sqlite::{self, Session},
    versions::VersionLocks,
};
use snafu::prelude::*;
use tap::Pipe;
use tempfile::TempDir;

pub mod access_logs;
pub mod db_pool;
pub mod ip_lists;
pub mod node_tasks;
pub mod versions;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to bring up the test schema: {source}"))]
    Migrate { source: sqlite::Error },
    #[snafu(display("Failed to open {url}: {source}"))]
    Open { url: String, source: sqlite::Error },
    #[snafu(display("Failed to create a scratch directory: {source}"))]
    TempDir { source: std::io::Error },
}

type Result<T> = std::result::Result<T, Error>;

/// Access-log table capacity for every fixture; small enough that a handful of writes exercises
/// rollover
pub const ROWS_PER_TABLE: u64 = 2;

/// One controller's worth of edgeplane components, wired the way `edgeplaned` wires them
pub struct Controller {
    pub session: Arc<Session>,
    pub versions: Arc<VersionLocks>,
    pub tasks: Arc<NodeTasks>,
    pub lists: Arc<IpLists>,
    pub tables: Arc<TableManager>,
    pub pool: Arc<DbPool>,
    pub logs: Arc<AccessLogs>,
}

impl Controller {
    pub async fn open(url: &str, instruments: &Arc<Instruments>) -> Result<Controller> {
        let session = Session::open(url, 4)
            .await
            .context(OpenSnafu { url })?
            .pipe(Arc::new);
        let versions = Arc::new(VersionLocks::new(
            session.clone(),
            edgeplane::versions::Config::default(),
            instruments.clone(),
        ));
        let tasks = Arc::new(NodeTasks::new(
            session.clone(),
            session.clone(),
            versions.clone(),
            instruments.clone(),
        ));
        let lists = Arc::new(IpLists::new(
            session.clone(),
            versions.clone(),
            tasks.clone(),
            edgeplane::ip_lists::Config::default(),
            instruments.clone(),
        ));
        let tables = Arc::new(TableManager::new(ROWS_PER_TABLE, instruments.clone()));
        let pool = Arc::new(DbPool::new(
            session.clone(),
            Arc::new(SqliteConnector::new(2)),
            tables.clone(),
            instruments.clone(),
        ));
        let logs = Arc::new(AccessLogs::new(
            Shard::new(ShardId::Default, session.clone()),
            Some(pool.clone()),
            tables.clone(),
            edgeplane::access_logs::Config {
                max_rows_per_table: ROWS_PER_TABLE,
                ..Default::default()
            },
            instruments.clone(),
        ));
        Ok(Controller {
            session,
            versions,
            tasks,
            lists,
            tables,
            pool,
            logs,
        })
    }

    /// This controller's view of the default log shard
    pub fn default_shard(&self) -> Shard {
        Shard::new(ShardId::Default, self.session.clone())
    }

    pub async fn close(&self) {
        self.pool.shutdown().await;
        self.session.close().await;
    }
}

/// A scratch datastore & a controller on top of it
pub struct Fixture {
    // Dropping this removes the database files, so it has to outlive every connection.
    dir: TempDir,
    url: String,
    instruments: Arc<Instruments>,
    pub controller: Controller,
}

impl Fixture {
    pub async fn new() -> Result<Fixture> {
        let dir = tempfile::tempdir().context(TempDirSnafu)?;
        let url = format!("sqlite://{}", dir.path().join("control.db").display());
        let instruments = Arc::new(Instruments::new("edgeplane"));
        let controller = Controller::open(&url, &instruments).await?;
        controller.session.migrate().await.context(MigrateSnafu)?;
        Ok(Fixture {
            dir,
            url,
            instruments,
            controller,
        })
    }

    /// Another controller sharing this fixture's datastore
    pub async fn peer(&self) -> Result<Controller> {
        Controller::open(&self.url, &self.instruments).await
    }

    /// URL for another database file alongside the control datastore
    pub fn sibling_url(&self, name: &str) -> String {
        format!("sqlite://{}", self.dir.path().join(name).display())
    }
}
