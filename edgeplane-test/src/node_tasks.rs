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

//! Integration tests for the node task queue.

use edgeplane::entities::{ClusterId, NodeId, NodeTaskType, PolicyId, Role, ServerId};
use libtest_mimic::Failed;

use crate::Fixture;

const CLUSTER: ClusterId = ClusterId::new(7);

/// Registering the same change over & over leaves one row per node, re-opened & re-stamped each
/// time; a node that acted on an older stamp can't close out the newer one
pub async fn registration_is_idempotent(fixture: Fixture) -> Result<(), Failed> {
    let tasks = &fixture.controller.tasks;
    let node = NodeId::new(1);

    tasks
        .register_node_task(Role::Node, CLUSTER, node, ServerId::default(), NodeTaskType::ConfigChanged)
        .await?;
    let first = tasks.find_doing_node_tasks(Role::Node, node, 0).await?;
    assert_eq!(first.len(), 1);

    // The node picks it up...
    let seen = first[0].clone();
    // ...but before it finishes, another controller records another change
    let peer = fixture.peer().await?;
    peer.tasks
        .register_node_task(Role::Node, CLUSTER, node, ServerId::default(), NodeTaskType::ConfigChanged)
        .await?;

    let second = tasks.find_doing_node_tasks(Role::Node, node, 0).await?;
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, seen.id);
    assert!(second[0].version > seen.version);

    // Completing against the stale version leaves the task pending
    assert!(!tasks
        .update_node_task_done_at(seen.id, seen.version, true, "")
        .await?);
    assert_eq!(tasks.count_doing_node_tasks(Role::Node).await?, 1);
    assert!(tasks
        .update_node_task_done_at(seen.id, second[0].version, true, "")
        .await?);
    assert_eq!(tasks.count_doing_node_tasks(Role::Node).await?, 0);

    // A failure stays visible
    tasks
        .register_node_task(Role::Node, CLUSTER, node, ServerId::default(), NodeTaskType::ConfigChanged)
        .await?;
    assert!(tasks.update_node_task_done(seen.id, false, "disk full").await?);
    let failed = tasks.find_doing_node_tasks(Role::Node, node, 0).await?;
    assert_eq!(failed.len(), 1);
    assert!(failed[0].is_done && !failed[0].is_ok);
    assert_eq!(failed[0].error, "disk full");

    // Re-registering clears the failure
    tasks
        .register_node_task(Role::Node, CLUSTER, node, ServerId::default(), NodeTaskType::ConfigChanged)
        .await?;
    let retried = tasks.find_doing_node_tasks(Role::Node, node, 0).await?;
    assert!(!retried[0].is_done && retried[0].error.is_empty());

    peer.close().await;
    Ok(())
}

/// A cluster-level task reaches every enabled node in the cluster, whichever controller extracts
/// it, and departed nodes are cleaned up on the next extraction
pub async fn cluster_tasks_reach_every_node(fixture: Fixture) -> Result<(), Failed> {
    let control = &fixture.controller;
    control.session.put_cluster(CLUSTER, PolicyId::new(1), true).await?;
    for id in 1..=3 {
        control
            .session
            .put_node(NodeId::new(id), CLUSTER, Role::Node, true)
            .await?;
    }
    // Switched off; shouldn't be bothered
    control
        .session
        .put_node(NodeId::new(4), CLUSTER, Role::Node, false)
        .await?;
    // Different role
    control
        .session
        .put_node(NodeId::new(5), CLUSTER, Role::Dns, true)
        .await?;

    control
        .tasks
        .register_cluster_task(Role::Node, CLUSTER, ServerId::default(), NodeTaskType::ScriptsChanged)
        .await?;
    assert_eq!(
        control.tasks.find_all_doing_task_cluster_ids(Role::Node).await?,
        vec![CLUSTER]
    );

    let peer = fixture.peer().await?;
    assert_eq!(peer.tasks.extract_all_cluster_tasks(Role::Node).await?, 3);
    // Nothing left to extract
    assert_eq!(peer.tasks.extract_all_cluster_tasks(Role::Node).await?, 0);

    for id in 1..=3 {
        let doing = control
            .tasks
            .find_doing_node_tasks(Role::Node, NodeId::new(id), 0)
            .await?;
        assert_eq!(doing.len(), 1);
        assert_eq!(doing[0].task_type, NodeTaskType::ScriptsChanged);
    }
    for id in [4, 5] {
        assert!(control
            .tasks
            .find_doing_node_tasks(Role::Node, NodeId::new(id), 0)
            .await?
            .is_empty());
    }
    assert!(control
        .tasks
        .exists_doing_node_tasks(Role::Node, &[NodeTaskType::ConfigChanged])
        .await?);
    assert!(!control
        .tasks
        .exists_doing_node_tasks(Role::Node, &[NodeTaskType::ScriptsChanged])
        .await?);

    // Each node gets nudged once
    let notifying = control.tasks.find_notifying_node_tasks(Role::Node, 10).await?;
    assert_eq!(notifying.len(), 3);
    let ids = notifying.iter().map(|t| t.id).collect::<Vec<_>>();
    assert_eq!(control.tasks.update_tasks_notified(&ids).await?, 3);
    assert!(control
        .tasks
        .find_notifying_node_tasks(Role::Node, 10)
        .await?
        .is_empty());

    // Node 3 leaves the cluster; the next change doesn't reach it & its stale task goes away
    control.session.remove_node(NodeId::new(3)).await?;
    control
        .tasks
        .register_cluster_task(Role::Node, CLUSTER, ServerId::default(), NodeTaskType::ScriptsChanged)
        .await?;
    assert_eq!(control.tasks.extract_all_cluster_tasks(Role::Node).await?, 2);
    assert!(control
        .tasks
        .find_doing_node_tasks(Role::Node, NodeId::new(3), 0)
        .await?
        .is_empty());
    assert_eq!(control.tasks.count_doing_node_tasks(Role::Node).await?, 2);

    assert_eq!(control.tasks.delete_cluster_tasks(Role::Node, CLUSTER).await?, 2);
    assert!(control
        .tasks
        .find_all_doing_task_cluster_ids(Role::Node)
        .await?
        .is_empty());

    peer.close().await;
    Ok(())
}
