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

//! # The log-database pool
//!
//! Operators configure any number of log databases ("db nodes") in the control plane; [DbPool]
//! keeps a live connection to each enabled one. Configuration changes are picked up by
//! [reconcile](DbPool::reconcile), run periodically: targets that have been removed or disabled
//! are closed, targets whose connection parameters changed are re-opened, and new targets are
//! opened & validated. A target that can't be reached is logged & tried again next time.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::Deserialize;
use snafu::{prelude::*, Backtrace};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{
    access_logs::{Shard, ShardId, TableManager},
    entities::{Day, DbNode, DbNodeId},
    gauge_setu,
    metrics::{self, Instruments, Sort},
    periodic::{Job, JobError},
    sqlite::Session,
    storage,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to read the configured log databases: {source}"))]
    Targets {
        source: storage::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Where the configured log databases come from
#[async_trait]
pub trait Targets {
    async fn find_enabled_db_nodes(&self) -> storage::Result<Vec<DbNode>>;
}

/// Opens a connection to a log database
#[async_trait]
pub trait Connector {
    async fn connect(&self, node: &DbNode) -> std::result::Result<Shard, JobError>;
}

/// [Connector] for SQLite log databases
pub struct SqliteConnector {
    max_connections: u32,
}

impl SqliteConnector {
    pub fn new(max_connections: u32) -> SqliteConnector {
        SqliteConnector { max_connections }
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    async fn connect(&self, node: &DbNode) -> std::result::Result<Shard, JobError> {
        // SQLite has no notion of credentials; they only matter for telling targets apart.
        let session = Session::open(&node.url, self.max_connections).await?;
        Ok(Shard::new(ShardId::Node(node.id), Arc::new(session)))
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub interval: Duration,
    #[serde(rename = "max-connections")]
    pub max_connections: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            interval: Duration::from_secs(60),
            max_connections: 4,
        }
    }
}

/// The outcome of one [DbPool::reconcile] pass
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Reconciled {
    pub opened: usize,
    pub closed: usize,
    pub failed: usize,
}

struct Member {
    node: DbNode,
    shard: Shard,
}

inventory::submit! { metrics::Registration::new("db_pool.members", Sort::IntegralGauge) }

pub struct DbPool {
    targets: Arc<dyn Targets + Send + Sync>,
    connector: Arc<dyn Connector + Send + Sync>,
    tables: Arc<TableManager>,
    members: RwLock<HashMap<DbNodeId, Member>>,
    instruments: Arc<Instruments>,
}

impl DbPool {
    pub fn new(
        targets: Arc<dyn Targets + Send + Sync>,
        connector: Arc<dyn Connector + Send + Sync>,
        tables: Arc<TableManager>,
        instruments: Arc<Instruments>,
    ) -> DbPool {
        DbPool {
            targets,
            connector,
            tables,
            members: RwLock::new(HashMap::new()),
            instruments,
        }
    }

    async fn open(&self, node: &DbNode) -> std::result::Result<Shard, JobError> {
        let shard = self.connector.connect(node).await?;
        let validated = async {
            shard.backend.ping().await?;
            self.tables
                .find_last_table(&shard, Day::today(), false)
                .await?;
            Ok::<(), JobError>(())
        }
        .await;
        match validated {
            Ok(_) => Ok(shard),
            Err(err) => {
                shard.backend.close().await;
                Err(err)
            }
        }
    }

    /// Bring the set of open connections into line with the configured targets
    pub async fn reconcile(&self) -> Result<Reconciled> {
        let wanted = self
            .targets
            .find_enabled_db_nodes()
            .await
            .context(TargetsSnafu)?
            .into_iter()
            .map(|node| (node.id, node))
            .collect::<HashMap<_, _>>();

        let mut result = Reconciled::default();

        let retired = {
            let mut members = self.members.write().await;
            let ids = members
                .iter()
                .filter(|(id, member)| {
                    !wanted
                        .get(*id)
                        .is_some_and(|node| node.same_connection(&member.node))
                })
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            ids.into_iter()
                .filter_map(|id| members.remove(&id))
                .collect::<Vec<_>>()
        };
        for member in retired {
            info!("Closing log database {} ({})", member.node.id, member.node.name);
            member.shard.backend.close().await;
            self.tables.reset_shard(member.shard.id).await;
            result.closed += 1;
        }

        let missing = {
            let members = self.members.read().await;
            wanted
                .into_values()
                .filter(|node| !members.contains_key(&node.id))
                .collect::<Vec<_>>()
        };
        for node in missing {
            match self.open(&node).await {
                Ok(shard) => {
                    info!("Opened log database {} ({})", node.id, node.name);
                    self.members
                        .write()
                        .await
                        .insert(node.id, Member { node, shard });
                    result.opened += 1;
                }
                Err(err) => {
                    warn!("Failed to open log database {} ({}): {err}", node.id, node.name);
                    result.failed += 1;
                }
            }
        }

        let n = self.members.read().await.len();
        gauge_setu!(self.instruments, "db_pool.members", n as u64, &[]);
        Ok(result)
    }

    /// Every open log database
    pub async fn live(&self) -> Vec<Shard> {
        let mut shards = self
            .members
            .read()
            .await
            .values()
            .map(|member| member.shard.clone())
            .collect::<Vec<_>>();
        shards.sort_by_key(|shard| shard.id);
        shards
    }

    /// An open log database, chosen at random
    pub async fn pick(&self) -> Option<Shard> {
        let shards = self.live().await;
        shards.choose(&mut rand::thread_rng()).cloned()
    }

    /// Close everything
    pub async fn shutdown(&self) {
        let members = self
            .members
            .write()
            .await
            .drain()
            .map(|(_, member)| member)
            .collect::<Vec<_>>();
        for member in members {
            member.shard.backend.close().await;
        }
        self.tables.reset_all().await;
    }
}

#[async_trait]
impl Job for DbPool {
    fn name(&self) -> &'static str {
        "db-pool"
    }
    async fn tick(&self) -> std::result::Result<(), JobError> {
        self.reconcile().await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use secrecy::SecretString;

    use super::*;
    use crate::{
        access_logs::Backend as _,
        sqlite::test_support::{scratch, sqlite_url},
    };

    #[tokio::test]
    async fn reconcile_follows_configuration() {
        let (dir, control) = scratch().await;
        let instruments = Arc::new(Instruments::new("edgeplane"));
        let tables = Arc::new(TableManager::new(100, instruments.clone()));
        let pool = DbPool::new(
            Arc::new(control.clone()),
            Arc::new(SqliteConnector::new(2)),
            tables.clone(),
            instruments,
        );
        let none = SecretString::from(String::new());
        let a = control
            .put_db_node("a", &sqlite_url(&dir, "a.db"), "", &none, true)
            .await
            .unwrap();
        let b = control
            .put_db_node("b", &sqlite_url(&dir, "b.db"), "", &none, true)
            .await
            .unwrap();
        control
            .put_db_node("bad", "sqlite:///no/such/dir/c.db", "", &none, true)
            .await
            .unwrap();

        let first = pool.reconcile().await.unwrap();
        assert_eq!(
            first,
            Reconciled {
                opened: 2,
                closed: 0,
                failed: 1
            }
        );
        let live = pool.live().await;
        assert_eq!(
            live.iter().map(|s| s.id).collect::<Vec<_>>(),
            vec![ShardId::Node(a), ShardId::Node(b)]
        );
        // Today's table was provisioned on open
        let today = crate::access_logs::table_name(Day::today(), 0);
        assert_eq!(live[0].backend.count_rows(&today).await.unwrap(), 0);

        // Steady state
        let again = pool.reconcile().await.unwrap();
        assert_eq!((again.opened, again.closed), (0, 0));

        control
            .update_db_node(a, &sqlite_url(&dir, "a.db"), false)
            .await
            .unwrap();
        control
            .update_db_node(b, &sqlite_url(&dir, "b2.db"), true)
            .await
            .unwrap();
        let changed = pool.reconcile().await.unwrap();
        assert_eq!((changed.opened, changed.closed), (1, 2));
        assert_eq!(pool.pick().await.map(|s| s.id), Some(ShardId::Node(b)));

        pool.shutdown().await;
        assert!(pool.live().await.is_empty());
        assert!(pool.pick().await.is_none());
    }
}
