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

//! Integration tests for IP list replication.
//!
//! The tests play the part of an edge node keeping a local copy of every item: it starts from
//! version zero, pages through the delta feed, and remembers the highest version it's seen.

use std::collections::HashMap;

use edgeplane::{
    entities::{
        ClusterId, IpItem, IpItemDraft, IpItemState, IpItemUpdate, ItemId, ListId, NodeId,
        NodeTaskType, PolicyId, Role,
    },
    ip_lists::IpLists,
};
use itertools::Itertools;
use libtest_mimic::Failed;

use crate::Fixture;

/// An edge node's replica of the IP items
#[derive(Default)]
struct Replica {
    items: HashMap<ItemId, IpItem>,
    cursor: u64,
}

impl Replica {
    /// Pull everything changed since the last sync, `page` items at a time; returns the number of
    /// items received
    async fn sync(&mut self, lists: &IpLists, page: usize) -> Result<usize, Failed> {
        let mut received = 0;
        loop {
            let batch = lists.list_ip_items_after_version(self.cursor, page).await?;
            if batch.is_empty() {
                return Ok(received);
            }
            // The feed is ordered by version
            assert!(batch.iter().tuple_windows().all(|(a, b)| a.version < b.version));
            received += batch.len();
            for item in batch {
                self.cursor = self.cursor.max(item.version);
                self.items.insert(item.id, item);
            }
        }
    }
    fn enabled(&self) -> Vec<ItemId> {
        self.items
            .values()
            .filter(|item| item.state == IpItemState::Enabled)
            .map(|item| item.id)
            .sorted()
            .collect()
    }
}

fn draft(list_id: ListId, ip: &str) -> IpItemDraft {
    IpItemDraft {
        list_id,
        ip_from: ip.to_owned(),
        reason: "integration test".to_owned(),
        event_level: "warning".to_owned(),
        ..Default::default()
    }
}

/// Changes made through either controller all reach a node syncing incrementally, deletions
/// included, and each change nudges the clusters enforcing the list
pub async fn replicas_converge(fixture: Fixture) -> Result<(), Failed> {
    let control = &fixture.controller;
    let peer = fixture.peer().await?;

    let cluster = ClusterId::new(3);
    let policy = PolicyId::new(30);
    control.session.put_cluster(cluster, policy, true).await?;
    control
        .session
        .put_node(NodeId::new(31), cluster, Role::Node, true)
        .await?;
    let list = control.session.create_ip_list("black", false).await?;
    control.session.attach_ip_list(policy, list).await?;

    let mut replica = Replica::default();
    assert_eq!(replica.sync(&control.lists, 2).await?, 0);

    let mut ids = Vec::new();
    for (i, ip) in ["192.0.2.1", "192.0.2.2", "2001:db8::1"].into_iter().enumerate() {
        // Alternate controllers
        let lists = if i % 2 == 0 { &control.lists } else { &peer.lists };
        ids.push(lists.create_ip_item(&draft(list, ip)).await?);
    }
    assert_eq!(replica.sync(&control.lists, 2).await?, 3);
    assert_eq!(replica.enabled(), ids.iter().copied().sorted().collect::<Vec<_>>());
    assert_eq!(replica.cursor, control.lists.latest_version().await?);

    // Edit one, delete another
    peer.lists
        .update_ip_item(
            ids[0],
            &IpItemUpdate {
                ip_from: "192.0.2.1".to_owned(),
                ip_to: "192.0.2.9".to_owned(),
                reason: "widened".to_owned(),
                ..Default::default()
            },
        )
        .await?;
    assert!(control.lists.disable_ip_item(ids[1]).await?);
    assert!(!peer.lists.disable_ip_item(ids[1]).await?);

    // Only the two changed items come down the wire
    assert_eq!(replica.sync(&peer.lists, 2).await?, 2);
    assert_eq!(replica.items[&ids[0]].ip_to, "192.0.2.9");
    assert_eq!(replica.items[&ids[1]].state, IpItemState::Disabled);
    assert_eq!(replica.enabled(), vec![ids[0], ids[2]]);
    assert_eq!(replica.sync(&peer.lists, 2).await?, 0);

    // The operator-facing views agree with the replica
    assert_eq!(control.lists.count_ip_items_with_list_id(list).await?, 2);
    assert!(control.lists.find_enabled_ip_item(ids[1]).await?.is_none());
    assert!(control.lists.find_ip_item(ids[1]).await?.is_some());
    assert_eq!(control.lists.count_unread_items().await?, 2);
    control.lists.update_items_read().await?;
    assert_eq!(control.lists.count_unread_items().await?, 0);

    // Every change was announced to the enforcing cluster
    assert_eq!(control.tasks.extract_all_cluster_tasks(Role::Node).await?, 1);
    let doing = control
        .tasks
        .find_doing_node_tasks(Role::Node, NodeId::new(31), 0)
        .await?;
    assert_eq!(doing.len(), 1);
    assert_eq!(doing[0].task_type, NodeTaskType::IpItemChanged);

    peer.close().await;
    Ok(())
}

/// Bulk disables stamp each affected row with its own version, so a node that syncs part-way
/// through still sees every row eventually
pub async fn bulk_disable_stamps_each_row(fixture: Fixture) -> Result<(), Failed> {
    let control = &fixture.controller;
    let black = control.session.create_ip_list("black", true).await?;
    let white = control.session.create_ip_list("white", false).await?;

    let mut targets = Vec::new();
    for list in [black, white, black] {
        targets.push(control.lists.create_ip_item(&draft(list, "198.51.100.7")).await?);
    }
    let bystander = control
        .lists
        .create_ip_item(&draft(black, "198.51.100.8"))
        .await?;

    let mut replica = Replica::default();
    replica.sync(&control.lists, 100).await?;
    let before = replica.cursor;

    assert_eq!(
        control
            .lists
            .disable_ip_items_with_ip(None, "198.51.100.7", "")
            .await?,
        3
    );
    // Idempotent
    assert_eq!(
        control
            .lists
            .disable_ip_items_with_ip(None, "198.51.100.7", "")
            .await?,
        0
    );

    let delta = control.lists.list_ip_items_after_version(before, 100).await?;
    assert_eq!(
        delta.iter().map(|item| item.id).sorted().collect::<Vec<_>>(),
        targets.iter().copied().sorted().collect::<Vec<_>>()
    );
    assert_eq!(delta.iter().map(|item| item.version).unique().count(), 3);

    // Page size one: the replica never misses a row
    assert_eq!(replica.sync(&control.lists, 1).await?, 3);
    assert_eq!(replica.enabled(), vec![bystander]);

    // Disabling a whole list
    assert_eq!(control.lists.disable_ip_items_with_list_id(black).await?, 1);
    assert_eq!(replica.sync(&control.lists, 1).await?, 1);
    assert!(replica.enabled().is_empty());

    Ok(())
}
