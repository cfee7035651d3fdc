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

//! # Node tasks
//!
//! Edge nodes poll the control plane; they are never pushed configuration. What they poll for is
//! their list of *tasks*: rows saying "something of type T changed that concerns you". A node
//! works through its tasks (pulling whatever state each one refers to) & reports each one done,
//! successfully or not.
//!
//! Most changes concern every node in a cluster, so the usual flow is:
//!
//! 1. something changes, and a *cluster-level* task is registered (`node_id` zero)
//! 2. periodically, the [Extractor] expands each cluster-level task into one *node-level* task per
//!    currently enabled node in that cluster, and removes the cluster-level row
//! 3. nodes find their node-level tasks, act on them, and mark them done
//!
//! Registration is an upsert keyed on a "unique id" derived from (role, target, scope, type), so
//! registering the same thing twice yields one row; the second registration simply resets the row
//! to "not done" & stamps it with a fresh version from the `NODE_TASK_VERSION` sequence.
//!
//! Those versions are what make extraction safe without a transaction: extraction notes the
//! highest version among the cluster-level rows it read, and afterwards deletes only rows at or
//! below it. A registration that lands mid-extraction has a higher version, survives, and is picked
//! up next time around.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use itertools::Itertools;
use opentelemetry::KeyValue;
use snafu::{prelude::*, Backtrace};
use tracing::{debug, info};

use crate::{
    counter_add,
    entities::{
        cluster_task_unique_id, node_task_unique_id, ClusterId, NodeId, NodeTask, NodeTaskId,
        NodeTaskType, Role, ServerId,
    },
    gauge_setu,
    metrics::{self, Instruments, Sort},
    periodic::{Job, JobError},
    storage,
    versions::{self, VersionLocks},
};

/// The sequence from which every task registration draws its version
pub const NODE_TASK_VERSION: &str = "NODE_TASK_VERSION";

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("A {what} task needs a non-zero {what} id"))]
    NoTarget {
        what: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("Datastore error while {action}: {source}"))]
    Storage {
        action: &'static str,
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to stamp a task version: {source}"))]
    Version {
        #[snafu(source(from(versions::Error, Box::new)))]
        source: Box<versions::Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Backend                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A task registration, as handed to [Backend::upsert_node_task]
#[derive(Clone, Debug)]
pub struct TaskRegistration {
    pub role: Role,
    pub cluster_id: ClusterId,
    /// Zero for a cluster-level task
    pub node_id: NodeId,
    pub server_id: ServerId,
    pub task_type: NodeTaskType,
    pub version: u64,
    pub updated_at: chrono::DateTime<Utc>,
}

impl TaskRegistration {
    pub fn unique_id(&self) -> String {
        if self.node_id.is_zero() {
            cluster_task_unique_id(self.role, self.cluster_id, self.server_id, self.task_type)
        } else {
            node_task_unique_id(self.role, self.node_id, self.server_id, self.task_type)
        }
    }
}

/// Datastore operations over the `node_tasks` table
///
/// "Doing" means "not done, or done but failed" throughout.
#[async_trait]
pub trait Backend {
    /// Insert, or reset an existing row with the same unique id to "not done"; the row's version
    /// must never move backwards
    async fn upsert_node_task(&self, task: &TaskRegistration) -> storage::Result<()>;
    /// Cluster-level rows for `role`, optionally restricted to one cluster, ordered by version
    async fn select_cluster_tasks(
        &self,
        role: Role,
        cluster_id: Option<ClusterId>,
    ) -> storage::Result<Vec<NodeTask>>;
    async fn delete_cluster_tasks(
        &self,
        role: Role,
        cluster_id: ClusterId,
        server_id: ServerId,
        task_type: NodeTaskType,
        max_version: u64,
    ) -> storage::Result<u64>;
    /// Delete node-level rows for this cluster, scope & type whose node is *not* in `keep`
    async fn delete_node_tasks_except(
        &self,
        role: Role,
        cluster_id: ClusterId,
        server_id: ServerId,
        task_type: NodeTaskType,
        keep: &[NodeId],
    ) -> storage::Result<u64>;
    async fn select_doing_node_tasks(
        &self,
        role: Role,
        node_id: NodeId,
        since_version: u64,
    ) -> storage::Result<Vec<NodeTask>>;
    /// Mark a task done; if `max_version` is given, only while the row's version hasn't moved
    /// past it
    async fn update_node_task_done(
        &self,
        id: NodeTaskId,
        is_ok: bool,
        error: &str,
        max_version: Option<u64>,
    ) -> storage::Result<bool>;
    async fn select_notifying_node_tasks(
        &self,
        role: Role,
        size: usize,
    ) -> storage::Result<Vec<NodeTask>>;
    async fn update_tasks_notified(&self, ids: &[NodeTaskId]) -> storage::Result<u64>;
    async fn delete_node_tasks_for_node(&self, role: Role, node_id: NodeId)
        -> storage::Result<u64>;
    async fn delete_tasks_for_cluster(
        &self,
        role: Role,
        cluster_id: ClusterId,
    ) -> storage::Result<u64>;
    async fn delete_node_task(&self, id: NodeTaskId) -> storage::Result<bool>;
    async fn select_doing_cluster_ids(&self, role: Role) -> storage::Result<Vec<ClusterId>>;
    async fn count_doing_node_tasks(&self, role: Role) -> storage::Result<u64>;
    async fn exists_doing_node_tasks(
        &self,
        role: Role,
        exclude: &[NodeTaskType],
    ) -> storage::Result<bool>;
}

/// What node tasks need to know about cluster membership
#[async_trait]
pub trait Topology {
    /// Nodes of `role` in `cluster_id` that are switched on & not deleted
    async fn find_enabled_node_ids(
        &self,
        role: Role,
        cluster_id: ClusterId,
    ) -> storage::Result<Vec<NodeId>>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           NodeTasks                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("node_tasks.registered", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("node_tasks.extracted", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("node_tasks.doing", Sort::IntegralGauge) }

pub struct NodeTasks {
    backend: Arc<dyn Backend + Send + Sync>,
    topology: Arc<dyn Topology + Send + Sync>,
    versions: Arc<VersionLocks>,
    instruments: Arc<Instruments>,
}

impl NodeTasks {
    pub fn new(
        backend: Arc<dyn Backend + Send + Sync>,
        topology: Arc<dyn Topology + Send + Sync>,
        versions: Arc<VersionLocks>,
        instruments: Arc<Instruments>,
    ) -> NodeTasks {
        NodeTasks {
            backend,
            topology,
            versions,
            instruments,
        }
    }

    async fn register(
        &self,
        role: Role,
        cluster_id: ClusterId,
        node_id: NodeId,
        server_id: ServerId,
        task_type: NodeTaskType,
    ) -> Result<()> {
        let version = self
            .versions
            .increase(NODE_TASK_VERSION, 1)
            .await
            .context(VersionSnafu)?;
        self.backend
            .upsert_node_task(&TaskRegistration {
                role,
                cluster_id,
                node_id,
                server_id,
                task_type,
                version,
                updated_at: Utc::now(),
            })
            .await
            .context(StorageSnafu {
                action: "registering a task",
            })?;
        counter_add!(
            self.instruments,
            "node_tasks.registered",
            1,
            &[KeyValue::new("type", task_type.as_str())]
        );
        Ok(())
    }

    /// Ask one node to act on a change of type `task_type`
    pub async fn register_node_task(
        &self,
        role: Role,
        cluster_id: ClusterId,
        node_id: NodeId,
        server_id: ServerId,
        task_type: NodeTaskType,
    ) -> Result<()> {
        ensure!(!node_id.is_zero(), NoTargetSnafu { what: "node" });
        self.register(role, cluster_id, node_id, server_id, task_type)
            .await
    }

    /// Ask every (enabled) node in a cluster to act on a change of type `task_type`; the fan-out
    /// happens at extraction time
    pub async fn register_cluster_task(
        &self,
        role: Role,
        cluster_id: ClusterId,
        server_id: ServerId,
        task_type: NodeTaskType,
    ) -> Result<()> {
        ensure!(!cluster_id.is_zero(), NoTargetSnafu { what: "cluster" });
        self.register(role, cluster_id, NodeId::default(), server_id, task_type)
            .await
    }

    /// Expand the cluster-level task for (`cluster_id`, `server_id`, `task_type`) into node-level
    /// tasks; returns the number of node tasks registered
    ///
    /// Node-level rows for nodes no longer enabled in the cluster are removed. Safe to re-run.
    pub async fn extract_cluster_task(
        &self,
        role: Role,
        cluster_id: ClusterId,
        server_id: ServerId,
        task_type: NodeTaskType,
    ) -> Result<usize> {
        let observed = self
            .backend
            .select_cluster_tasks(role, Some(cluster_id))
            .await
            .context(StorageSnafu {
                action: "reading cluster tasks",
            })?
            .into_iter()
            .filter(|task| task.server_id == server_id && task.task_type == task_type)
            .map(|task| task.version)
            .max();
        let Some(observed) = observed else {
            debug!("No {task_type} task pending for cluster {cluster_id}");
            return Ok(0);
        };

        let node_ids = self
            .topology
            .find_enabled_node_ids(role, cluster_id)
            .await
            .context(StorageSnafu {
                action: "enumerating cluster nodes",
            })?;
        for node_id in &node_ids {
            self.register(role, cluster_id, *node_id, server_id, task_type)
                .await?;
        }
        let stale = self
            .backend
            .delete_node_tasks_except(role, cluster_id, server_id, task_type, &node_ids)
            .await
            .context(StorageSnafu {
                action: "removing tasks for departed nodes",
            })?;
        // Anything registered since we read is newer than `observed` & stays put.
        self.backend
            .delete_cluster_tasks(role, cluster_id, server_id, task_type, observed)
            .await
            .context(StorageSnafu {
                action: "removing extracted cluster tasks",
            })?;

        debug!(
            "Extracted {task_type} for cluster {cluster_id} into {} node tasks ({stale} stale removed)",
            node_ids.len()
        );
        counter_add!(
            self.instruments,
            "node_tasks.extracted",
            node_ids.len() as u64,
            &[KeyValue::new("type", task_type.as_str())]
        );
        Ok(node_ids.len())
    }

    /// Extract every pending cluster-level task for `role`; returns the number of node tasks
    /// registered
    pub async fn extract_all_cluster_tasks(&self, role: Role) -> Result<usize> {
        let pending = self
            .backend
            .select_cluster_tasks(role, None)
            .await
            .context(StorageSnafu {
                action: "reading cluster tasks",
            })?;
        let mut registered = 0;
        for (cluster_id, server_id, task_type) in pending
            .into_iter()
            .map(|task| (task.cluster_id, task.server_id, task.task_type))
            .unique()
        {
            registered += self
                .extract_cluster_task(role, cluster_id, server_id, task_type)
                .await?;
        }
        Ok(registered)
    }

    /// Tasks `node_id` still has to act on (or failed to), oldest first; `since_version` zero means
    /// "all of them"
    pub async fn find_doing_node_tasks(
        &self,
        role: Role,
        node_id: NodeId,
        since_version: u64,
    ) -> Result<Vec<NodeTask>> {
        self.backend
            .select_doing_node_tasks(role, node_id, since_version)
            .await
            .context(StorageSnafu {
                action: "reading node tasks",
            })
    }

    /// Record the outcome of a task; a failure stays visible through [find_doing_node_tasks] until
    /// the task is completed successfully or re-registered
    ///
    /// [find_doing_node_tasks]: NodeTasks::find_doing_node_tasks
    pub async fn update_node_task_done(
        &self,
        task_id: NodeTaskId,
        is_ok: bool,
        error: &str,
    ) -> Result<bool> {
        self.backend
            .update_node_task_done(task_id, is_ok, error, None)
            .await
            .context(StorageSnafu {
                action: "completing a task",
            })
    }

    /// As [update_node_task_done], but only if the task hasn't been re-registered since the node
    /// read it at `version`; returns `false` if it has (the task stays pending)
    ///
    /// [update_node_task_done]: NodeTasks::update_node_task_done
    pub async fn update_node_task_done_at(
        &self,
        task_id: NodeTaskId,
        version: u64,
        is_ok: bool,
        error: &str,
    ) -> Result<bool> {
        self.backend
            .update_node_task_done(task_id, is_ok, error, Some(version))
            .await
            .context(StorageSnafu {
                action: "completing a task",
            })
    }

    /// Node-level tasks whose nodes haven't yet been nudged
    pub async fn find_notifying_node_tasks(&self, role: Role, size: usize) -> Result<Vec<NodeTask>> {
        self.backend
            .select_notifying_node_tasks(role, size)
            .await
            .context(StorageSnafu {
                action: "reading tasks to notify",
            })
    }

    pub async fn update_tasks_notified(&self, ids: &[NodeTaskId]) -> Result<u64> {
        self.backend
            .update_tasks_notified(ids)
            .await
            .context(StorageSnafu {
                action: "marking tasks notified",
            })
    }

    /// Remove every task for a node (it's been deleted)
    pub async fn delete_node_tasks(&self, role: Role, node_id: NodeId) -> Result<u64> {
        let n = self
            .backend
            .delete_node_tasks_for_node(role, node_id)
            .await
            .context(StorageSnafu {
                action: "deleting a node's tasks",
            })?;
        info!("Removed {n} tasks for departed {role} node {node_id}");
        Ok(n)
    }

    /// Remove every task, cluster- or node-level, for a cluster
    pub async fn delete_cluster_tasks(&self, role: Role, cluster_id: ClusterId) -> Result<u64> {
        self.backend
            .delete_tasks_for_cluster(role, cluster_id)
            .await
            .context(StorageSnafu {
                action: "deleting a cluster's tasks",
            })
    }

    pub async fn delete_node_task(&self, task_id: NodeTaskId) -> Result<bool> {
        self.backend
            .delete_node_task(task_id)
            .await
            .context(StorageSnafu {
                action: "deleting a task",
            })
    }

    /// Clusters with at least one task outstanding
    pub async fn find_all_doing_task_cluster_ids(&self, role: Role) -> Result<Vec<ClusterId>> {
        self.backend
            .select_doing_cluster_ids(role)
            .await
            .context(StorageSnafu {
                action: "reading busy clusters",
            })
    }

    pub async fn count_doing_node_tasks(&self, role: Role) -> Result<u64> {
        self.backend
            .count_doing_node_tasks(role)
            .await
            .context(StorageSnafu {
                action: "counting node tasks",
            })
    }

    /// Is any node-level task of a type not in `exclude` outstanding?
    pub async fn exists_doing_node_tasks(
        &self,
        role: Role,
        exclude: &[NodeTaskType],
    ) -> Result<bool> {
        self.backend
            .exists_doing_node_tasks(role, exclude)
            .await
            .context(StorageSnafu {
                action: "checking for node tasks",
            })
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Extractor                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// [Job] expanding pending cluster-level tasks for each of a set of roles
pub struct Extractor {
    tasks: Arc<NodeTasks>,
    roles: Vec<Role>,
}

impl Extractor {
    pub fn new(tasks: Arc<NodeTasks>, roles: Vec<Role>) -> Extractor {
        Extractor { tasks, roles }
    }
}

#[async_trait]
impl Job for Extractor {
    fn name(&self) -> &'static str {
        "node-tasks-extractor"
    }
    async fn tick(&self) -> std::result::Result<(), JobError> {
        for role in &self.roles {
            let n = self.tasks.extract_all_cluster_tasks(*role).await?;
            if n > 0 {
                debug!("Registered {n} {role} node tasks");
            }
            let doing = self.tasks.count_doing_node_tasks(*role).await?;
            gauge_setu!(
                self.tasks.instruments,
                "node_tasks.doing",
                doing,
                &[KeyValue::new("role", role.as_str())]
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::{
        entities::PolicyId,
        sqlite::{test_support::scratch, Session},
        versions,
    };

    fn tasks(session: &Session) -> NodeTasks {
        let session = Arc::new(session.clone());
        let instruments = Arc::new(Instruments::new("edgeplane"));
        let versions = Arc::new(VersionLocks::new(
            session.clone(),
            versions::Config::default(),
            instruments.clone(),
        ));
        NodeTasks::new(session.clone(), session, versions, instruments)
    }

    #[tokio::test]
    async fn registration_is_idempotent() {
        let (_dir, session) = scratch().await;
        let tasks = tasks(&session);
        let (cluster, node) = (ClusterId::new(1), NodeId::new(11));
        tasks
            .register_node_task(
                Role::Node,
                cluster,
                node,
                ServerId::default(),
                NodeTaskType::ConfigChanged,
            )
            .await
            .unwrap();
        let doing = tasks
            .find_doing_node_tasks(Role::Node, node, 0)
            .await
            .unwrap();
        assert_eq!(doing.len(), 1);
        assert!(tasks
            .update_node_task_done(doing[0].id, true, "")
            .await
            .unwrap());
        assert!(tasks
            .find_doing_node_tasks(Role::Node, node, 0)
            .await
            .unwrap()
            .is_empty());

        tasks
            .register_node_task(
                Role::Node,
                cluster,
                node,
                ServerId::default(),
                NodeTaskType::ConfigChanged,
            )
            .await
            .unwrap();
        let again = tasks
            .find_doing_node_tasks(Role::Node, node, 0)
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, doing[0].id);
        assert!(!again[0].is_done);
        assert!(again[0].version > doing[0].version);

        assert!(matches!(
            tasks
                .register_node_task(
                    Role::Node,
                    cluster,
                    NodeId::default(),
                    ServerId::default(),
                    NodeTaskType::ConfigChanged
                )
                .await,
            Err(Error::NoTarget { .. })
        ));
    }

    #[tokio::test]
    async fn completion_is_version_guarded() {
        let (_dir, session) = scratch().await;
        let tasks = tasks(&session);
        let node = NodeId::new(3);
        tasks
            .register_node_task(
                Role::Dns,
                ClusterId::new(1),
                node,
                ServerId::default(),
                NodeTaskType::DnsConfigChanged,
            )
            .await
            .unwrap();
        let read = tasks
            .find_doing_node_tasks(Role::Dns, node, 0)
            .await
            .unwrap()
            .remove(0);
        // Re-registered while the node was busy with it...
        tasks
            .register_node_task(
                Role::Dns,
                ClusterId::new(1),
                node,
                ServerId::default(),
                NodeTaskType::DnsConfigChanged,
            )
            .await
            .unwrap();
        // so completing the stale read must leave it pending.
        assert!(!tasks
            .update_node_task_done_at(read.id, read.version, true, "")
            .await
            .unwrap());
        assert_eq!(tasks.count_doing_node_tasks(Role::Dns).await.unwrap(), 1);
        // Failure is sticky
        assert!(tasks
            .update_node_task_done(read.id, false, "timed out")
            .await
            .unwrap());
        let failed = tasks
            .find_doing_node_tasks(Role::Dns, node, 0)
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error, "timed out");
        assert!(failed[0].is_done && !failed[0].is_ok);
    }

    /// Cluster membership as seen by a controller that races a peer: the first lookup lets the
    /// peer register the same cluster task again before answering
    struct Racing {
        session: Session,
        peer: NodeTasks,
        fired: AtomicBool,
    }

    #[async_trait]
    impl Topology for Racing {
        async fn find_enabled_node_ids(
            &self,
            role: Role,
            cluster_id: ClusterId,
        ) -> storage::Result<Vec<NodeId>> {
            if !self.fired.swap(true, Ordering::SeqCst) {
                self.peer
                    .register_cluster_task(
                        role,
                        cluster_id,
                        ServerId::default(),
                        NodeTaskType::IpItemChanged,
                    )
                    .await
                    .unwrap();
            }
            self.session.find_enabled_node_ids(role, cluster_id).await
        }
    }

    #[tokio::test]
    async fn registrations_during_extraction_survive() {
        let (_dir, session) = scratch().await;
        let cluster = ClusterId::new(7);
        session
            .put_cluster(cluster, PolicyId::default(), true)
            .await
            .unwrap();
        for id in [71, 72] {
            session
                .put_node(NodeId::new(id), cluster, Role::Node, true)
                .await
                .unwrap();
        }
        let instruments = Arc::new(Instruments::new("edgeplane"));
        let shared = Arc::new(session.clone());
        let tasks = NodeTasks::new(
            shared.clone(),
            Arc::new(Racing {
                session: session.clone(),
                peer: self::tasks(&session),
                fired: AtomicBool::new(false),
            }),
            Arc::new(VersionLocks::new(
                shared,
                versions::Config::default(),
                instruments.clone(),
            )),
            instruments,
        );

        tasks
            .register_cluster_task(
                Role::Node,
                cluster,
                ServerId::default(),
                NodeTaskType::IpItemChanged,
            )
            .await
            .unwrap();
        let before = session
            .select_cluster_tasks(Role::Node, Some(cluster))
            .await
            .unwrap();
        assert_eq!(before.len(), 1);

        assert_eq!(
            tasks
                .extract_cluster_task(
                    Role::Node,
                    cluster,
                    ServerId::default(),
                    NodeTaskType::IpItemChanged
                )
                .await
                .unwrap(),
            2
        );
        // The registration that landed mid-extraction is still pending...
        let after = session
            .select_cluster_tasks(Role::Node, Some(cluster))
            .await
            .unwrap();
        assert_eq!(after.len(), 1);
        assert!(after[0].version > before[0].version);

        // ...and the next pass picks it up.
        assert_eq!(
            tasks.extract_all_cluster_tasks(Role::Node).await.unwrap(),
            2
        );
        assert!(session
            .select_cluster_tasks(Role::Node, Some(cluster))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn extraction_tracks_membership() {
        let (_dir, session) = scratch().await;
        let tasks = tasks(&session);
        let cluster = ClusterId::new(5);
        session
            .put_cluster(cluster, PolicyId::default(), true)
            .await
            .unwrap();
        for id in [51, 52, 53] {
            session
                .put_node(NodeId::new(id), cluster, Role::Node, true)
                .await
                .unwrap();
        }
        tasks
            .register_cluster_task(
                Role::Node,
                cluster,
                ServerId::default(),
                NodeTaskType::IpItemChanged,
            )
            .await
            .unwrap();
        assert_eq!(
            tasks.extract_all_cluster_tasks(Role::Node).await.unwrap(),
            3
        );
        // Nothing left to extract
        assert_eq!(
            tasks.extract_all_cluster_tasks(Role::Node).await.unwrap(),
            0
        );

        session
            .put_node(NodeId::new(53), cluster, Role::Node, false)
            .await
            .unwrap();
        tasks
            .register_cluster_task(
                Role::Node,
                cluster,
                ServerId::default(),
                NodeTaskType::IpItemChanged,
            )
            .await
            .unwrap();
        assert_eq!(
            tasks
                .extract_cluster_task(
                    Role::Node,
                    cluster,
                    ServerId::default(),
                    NodeTaskType::IpItemChanged
                )
                .await
                .unwrap(),
            2
        );
        assert!(tasks
            .find_doing_node_tasks(Role::Node, NodeId::new(53), 0)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            tasks
                .find_all_doing_task_cluster_ids(Role::Node)
                .await
                .unwrap(),
            vec![cluster]
        );
        assert!(!tasks
            .exists_doing_node_tasks(Role::Node, &[NodeTaskType::IpItemChanged])
            .await
            .unwrap());
        assert!(tasks
            .exists_doing_node_tasks(Role::Node, &[])
            .await
            .unwrap());
    }
}
