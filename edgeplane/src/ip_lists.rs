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

//! # IP lists
//!
//! IP lists (block lists, allow lists) are replicated to every edge node that enforces them, and
//! they can be large: pushing the whole list on every change is out of the question. Instead,
//! every mutation of an item (create, update, disable) stamps it with a fresh version drawn from
//! the global `IP_ITEM_VERSION` sequence, and nodes sync incrementally by asking for "every item
//! with a version greater than the last one I saw" ([IpLists::list_ip_items_after_version]).
//!
//! For that to work, two things have to hold:
//!
//! - items are never deleted out from under a consumer; "removing" an item disables it (with a
//!   fresh version, so that the disable itself shows up as a delta). Disabled & long-expired items
//!   are only hard-deleted after a grace period ([Sweeper]), by which time every live node has
//!   long since synced past them.
//! - bulk operations stamp *each* row with its own version, rather than giving a batch of rows one
//!   shared version. A consumer paging through a batch that shares a version could otherwise
//!   checkpoint at that version mid-batch & never see the rest.
//!
//! After each change, the clusters enforcing the list are sent an `ip_item_changed` task so that
//! their nodes know to sync.

use std::{collections::BTreeSet, net::IpAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use snafu::{prelude::*, Backtrace};
use tracing::{debug, info, warn};

use crate::{
    counter_add,
    entities::{
        ClusterId, IpItem, IpItemDraft, IpItemState, IpItemType, IpItemUpdate, IpList,
        ItemFilter, ItemId, ListId, NodeTaskType, Role, ServerId,
    },
    metrics::{self, Instruments, Sort},
    node_tasks::{self, NodeTasks},
    periodic::{Job, JobError},
    storage,
    versions::{self, VersionLocks},
};

/// The sequence from which every item mutation draws its version
pub const IP_ITEM_VERSION: &str = "IP_ITEM_VERSION";

/// Lock serializing sweeps across controllers
const SWEEPER_LOCK: &str = "IP_ITEM_SWEEPER";

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not an IP address"))]
    BadIp {
        text: String,
        source: std::net::AddrParseError,
        backtrace: Backtrace,
    },
    #[snafu(display("{ip_from}-{ip_to} is not a valid range"))]
    BadRange {
        ip_from: IpAddr,
        ip_to: IpAddr,
        backtrace: Backtrace,
    },
    #[snafu(display("{ip} can't be used in an item of type {item_type}"))]
    FamilyMismatch {
        ip: IpAddr,
        item_type: IpItemType,
        backtrace: Backtrace,
    },
    #[snafu(display("IP list {id} is disabled"))]
    ListDisabled { id: ListId, backtrace: Backtrace },
    #[snafu(display("IP items need an address unless their type is 'all'"))]
    MissingIp { backtrace: Backtrace },
    #[snafu(display("No IP item with id {id}"))]
    NoSuchItem { id: ItemId, backtrace: Backtrace },
    #[snafu(display("No IP list with id {id}"))]
    NoSuchList { id: ListId, backtrace: Backtrace },
    #[snafu(display("Failed to notify clusters of a change to list {list_id}: {source}"))]
    Notify {
        list_id: ListId,
        #[snafu(source(from(node_tasks::Error, Box::new)))]
        source: Box<node_tasks::Error>,
    },
    #[snafu(display("Datastore error while {action}: {source}"))]
    Storage {
        action: &'static str,
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Version lock error: {source}"))]
    Version {
        #[snafu(source(from(versions::Error, Box::new)))]
        source: Box<versions::Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Backend                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[async_trait]
pub trait Backend {
    async fn select_ip_list(&self, id: ListId) -> storage::Result<Option<IpList>>;
    async fn insert_ip_item(
        &self,
        draft: &IpItemDraft,
        item_type: IpItemType,
        version: u64,
        now: i64,
    ) -> storage::Result<ItemId>;
    async fn update_ip_item(
        &self,
        id: ItemId,
        update: &IpItemUpdate,
        item_type: IpItemType,
        version: u64,
        now: i64,
    ) -> storage::Result<bool>;
    async fn select_ip_item(&self, id: ItemId) -> storage::Result<Option<IpItem>>;
    /// Disable `id` & stamp it with `version`, if it's currently enabled
    async fn disable_ip_item(&self, id: ItemId, version: u64, now: i64) -> storage::Result<bool>;
    async fn select_enabled_item_ids(
        &self,
        filter: &ItemFilter,
    ) -> storage::Result<Vec<(ItemId, ListId)>>;
    /// Items, in any state, with a version greater than `since`, ordered by (version, id)
    async fn select_items_after_version(
        &self,
        since: u64,
        size: usize,
    ) -> storage::Result<Vec<IpItem>>;
    async fn select_enabled_items_with_list_id(
        &self,
        list_id: ListId,
        offset: usize,
        size: usize,
    ) -> storage::Result<Vec<IpItem>>;
    async fn count_enabled_items_with_list_id(&self, list_id: ListId) -> storage::Result<u64>;
    async fn mark_items_read(&self) -> storage::Result<u64>;
    async fn count_unread_items(&self) -> storage::Result<u64>;
    async fn delete_stale_items(
        &self,
        disabled_before: i64,
        expired_before: i64,
    ) -> storage::Result<u64>;
    /// Enabled clusters whose firewall policy references `list_id` (every enabled cluster, if the
    /// list is global)
    async fn find_enabled_cluster_ids_with_ip_list(
        &self,
        list_id: ListId,
    ) -> storage::Result<Vec<ClusterId>>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           validation                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn parse_ip(text: &str) -> Result<IpAddr> {
    text.trim().parse::<IpAddr>().context(BadIpSnafu { text })
}

/// The stored form of an address: empty stays empty, anything else is parsed & re-rendered
fn canonical_ip(text: &str) -> Result<String> {
    if text.trim().is_empty() {
        Ok(String::new())
    } else {
        Ok(parse_ip(text)?.to_string())
    }
}

/// An item's addresses after validation, in the form they're stored & matched in
#[derive(Clone, Debug, Eq, PartialEq)]
struct Checked {
    item_type: IpItemType,
    ip_from: String,
    ip_to: String,
}

/// Check an item's addresses & settle its type (inferred from `ip_from` when not given)
fn validate(ip_from: &str, ip_to: &str, item_type: Option<IpItemType>) -> Result<Checked> {
    if item_type == Some(IpItemType::All) {
        return Ok(Checked {
            item_type: IpItemType::All,
            ip_from: ip_from.trim().to_owned(),
            ip_to: ip_to.trim().to_owned(),
        });
    }
    ensure!(!ip_from.trim().is_empty(), MissingIpSnafu);
    let from = parse_ip(ip_from)?;
    let item_type = item_type.unwrap_or(if from.is_ipv4() {
        IpItemType::Ipv4
    } else {
        IpItemType::Ipv6
    });
    ensure!(
        item_type.admits(&from),
        FamilyMismatchSnafu {
            ip: from,
            item_type
        }
    );
    let mut to_text = String::new();
    if !ip_to.trim().is_empty() {
        let to = parse_ip(ip_to)?;
        ensure!(
            item_type.admits(&to),
            FamilyMismatchSnafu { ip: to, item_type }
        );
        ensure!(
            to >= from,
            BadRangeSnafu {
                ip_from: from,
                ip_to: to
            }
        );
        to_text = to.to_string();
    }
    Ok(Checked {
        item_type,
        ip_from: from.to_string(),
        ip_to: to_text,
    })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            IpLists                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// How long disabled (or expired) items are kept before being hard-deleted
    #[serde(rename = "grace-period")]
    pub grace_period: Duration,
    #[serde(rename = "sweep-interval")]
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            grace_period: Duration::from_secs(7 * 86400),
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

inventory::submit! { metrics::Registration::new("ip_lists.items.stamped", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("ip_lists.items.swept", Sort::IntegralCounter) }

pub struct IpLists {
    backend: Arc<dyn Backend + Send + Sync>,
    versions: Arc<VersionLocks>,
    tasks: Arc<NodeTasks>,
    config: Config,
    instruments: Arc<Instruments>,
}

impl IpLists {
    pub fn new(
        backend: Arc<dyn Backend + Send + Sync>,
        versions: Arc<VersionLocks>,
        tasks: Arc<NodeTasks>,
        config: Config,
        instruments: Arc<Instruments>,
    ) -> IpLists {
        IpLists {
            backend,
            versions,
            tasks,
            config,
            instruments,
        }
    }

    async fn next_version(&self) -> Result<u64> {
        let version = self
            .versions
            .increase(IP_ITEM_VERSION, 1)
            .await
            .context(VersionSnafu)?;
        counter_add!(self.instruments, "ip_lists.items.stamped", 1, &[]);
        Ok(version)
    }

    async fn enabled_list(&self, id: ListId) -> Result<IpList> {
        let list = self
            .backend
            .select_ip_list(id)
            .await
            .context(StorageSnafu {
                action: "reading an IP list",
            })?
            .context(NoSuchListSnafu { id })?;
        ensure!(list.is_enabled, ListDisabledSnafu { id });
        Ok(list)
    }

    /// Add an item to an (enabled) list
    pub async fn create_ip_item(&self, draft: &IpItemDraft) -> Result<ItemId> {
        let checked = validate(&draft.ip_from, &draft.ip_to, draft.item_type)?;
        self.enabled_list(draft.list_id).await?;
        let draft = IpItemDraft {
            ip_from: checked.ip_from,
            ip_to: checked.ip_to,
            ..draft.clone()
        };
        let version = self.next_version().await?;
        let id = self
            .backend
            .insert_ip_item(&draft, checked.item_type, version, Utc::now().timestamp())
            .await
            .context(StorageSnafu {
                action: "inserting an IP item",
            })?;
        debug!("Created IP item {id} in list {} at v{version}", draft.list_id);
        self.notify_update(draft.list_id).await?;
        Ok(id)
    }

    /// Replace an item's mutable fields; its state is left as-is
    pub async fn update_ip_item(&self, id: ItemId, update: &IpItemUpdate) -> Result<()> {
        let checked = validate(&update.ip_from, &update.ip_to, update.item_type)?;
        let item = self.find_ip_item(id).await?.context(NoSuchItemSnafu { id })?;
        let update = IpItemUpdate {
            ip_from: checked.ip_from,
            ip_to: checked.ip_to,
            ..update.clone()
        };
        let version = self.next_version().await?;
        let updated = self
            .backend
            .update_ip_item(id, &update, checked.item_type, version, Utc::now().timestamp())
            .await
            .context(StorageSnafu {
                action: "updating an IP item",
            })?;
        // Hard-deleted out from under us
        ensure!(updated, NoSuchItemSnafu { id });
        self.notify_update(item.list_id).await?;
        Ok(())
    }

    /// Soft-delete an item; returns `false` if it was already disabled
    pub async fn disable_ip_item(&self, id: ItemId) -> Result<bool> {
        let item = self.find_ip_item(id).await?.context(NoSuchItemSnafu { id })?;
        if item.state == IpItemState::Disabled {
            return Ok(false);
        }
        let version = self.next_version().await?;
        let disabled = self
            .backend
            .disable_ip_item(id, version, Utc::now().timestamp())
            .await
            .context(StorageSnafu {
                action: "disabling an IP item",
            })?;
        if disabled {
            self.notify_update(item.list_id).await?;
        }
        Ok(disabled)
    }

    /// Disable every enabled item matching `filter`, each with its own version; notifies each
    /// affected list once
    async fn disable_matching(&self, filter: &ItemFilter) -> Result<usize> {
        let targets = self
            .backend
            .select_enabled_item_ids(filter)
            .await
            .context(StorageSnafu {
                action: "finding items to disable",
            })?;
        let mut lists = BTreeSet::new();
        let mut count = 0;
        for (id, list_id) in targets {
            let version = self.next_version().await?;
            if self
                .backend
                .disable_ip_item(id, version, Utc::now().timestamp())
                .await
                .context(StorageSnafu {
                    action: "disabling an IP item",
                })?
            {
                count += 1;
                lists.insert(list_id);
            }
        }
        for list_id in lists {
            self.notify_update(list_id).await?;
        }
        Ok(count)
    }

    /// Disable the enabled items for an address (range); `list_id` restricts this to one list
    ///
    /// Addresses are matched in canonical form, so `" 10.0.0.1"` and `"10.0.0.1"` are the same.
    pub async fn disable_ip_items_with_ip(
        &self,
        list_id: Option<ListId>,
        ip_from: &str,
        ip_to: &str,
    ) -> Result<usize> {
        self.disable_matching(&ItemFilter::Ip {
            list_id,
            ip_from: canonical_ip(ip_from)?,
            ip_to: canonical_ip(ip_to)?,
        })
        .await
    }

    /// Disable every enabled item in a list
    pub async fn disable_ip_items_with_list_id(&self, list_id: ListId) -> Result<usize> {
        self.disable_matching(&ItemFilter::List(list_id)).await
    }

    /// Tell every cluster enforcing `list_id` that it changed; returns the number of clusters
    pub async fn notify_update(&self, list_id: ListId) -> Result<usize> {
        let clusters = self
            .backend
            .find_enabled_cluster_ids_with_ip_list(list_id)
            .await
            .context(StorageSnafu {
                action: "finding clusters using a list",
            })?;
        for cluster_id in &clusters {
            self.tasks
                .register_cluster_task(
                    Role::Node,
                    *cluster_id,
                    ServerId::default(),
                    NodeTaskType::IpItemChanged,
                )
                .await
                .context(NotifySnafu { list_id })?;
        }
        Ok(clusters.len())
    }

    /// The delta feed: up to `size` items, in any state, changed after version `since`
    pub async fn list_ip_items_after_version(
        &self,
        since: u64,
        size: usize,
    ) -> Result<Vec<IpItem>> {
        self.backend
            .select_items_after_version(since, size)
            .await
            .context(StorageSnafu {
                action: "reading the item delta",
            })
    }

    pub async fn find_ip_item(&self, id: ItemId) -> Result<Option<IpItem>> {
        self.backend
            .select_ip_item(id)
            .await
            .context(StorageSnafu {
                action: "reading an IP item",
            })
    }

    pub async fn find_enabled_ip_item(&self, id: ItemId) -> Result<Option<IpItem>> {
        Ok(self
            .find_ip_item(id)
            .await?
            .filter(|item| item.state == IpItemState::Enabled))
    }

    /// A page of a list's enabled items, newest first
    pub async fn list_ip_items_with_list_id(
        &self,
        list_id: ListId,
        offset: usize,
        size: usize,
    ) -> Result<Vec<IpItem>> {
        self.backend
            .select_enabled_items_with_list_id(list_id, offset, size)
            .await
            .context(StorageSnafu {
                action: "listing IP items",
            })
    }

    pub async fn count_ip_items_with_list_id(&self, list_id: ListId) -> Result<u64> {
        self.backend
            .count_enabled_items_with_list_id(list_id)
            .await
            .context(StorageSnafu {
                action: "counting IP items",
            })
    }

    /// Mark every enabled item as seen by an operator
    pub async fn update_items_read(&self) -> Result<u64> {
        self.backend
            .mark_items_read()
            .await
            .context(StorageSnafu {
                action: "marking items read",
            })
    }

    pub async fn count_unread_items(&self) -> Result<u64> {
        self.backend
            .count_unread_items()
            .await
            .context(StorageSnafu {
                action: "counting unread items",
            })
    }

    /// The most recent version handed out to any item; consumers may start a full sync from zero
    /// & checkpoint here
    pub async fn latest_version(&self) -> Result<u64> {
        Ok(self
            .versions
            .read(IP_ITEM_VERSION)
            .await
            .context(VersionSnafu)?
            .unwrap_or(0))
    }

    /// Hard-delete items disabled, or expired, more than the grace period before `now`
    pub async fn clean_expired_ip_items(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now.timestamp() - self.config.grace_period.as_secs() as i64;
        let n = self
            .backend
            .delete_stale_items(cutoff, cutoff)
            .await
            .context(StorageSnafu {
                action: "sweeping stale items",
            })?;
        counter_add!(self.instruments, "ip_lists.items.swept", n, &[]);
        Ok(n)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Sweeper                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// [Job] hard-deleting stale items; only one controller sweeps at a time
pub struct Sweeper {
    lists: Arc<IpLists>,
}

impl Sweeper {
    pub fn new(lists: Arc<IpLists>) -> Sweeper {
        Sweeper { lists }
    }
}

#[async_trait]
impl Job for Sweeper {
    fn name(&self) -> &'static str {
        "ip-items-sweeper"
    }
    async fn tick(&self) -> std::result::Result<(), JobError> {
        let versions = &self.lists.versions;
        if !versions
            .lock(SWEEPER_LOCK, self.lists.config.sweep_interval)
            .await?
        {
            debug!("Another controller is sweeping IP items");
            return Ok(());
        }
        let result = self.lists.clean_expired_ip_items(Utc::now()).await;
        // The lock times out on its own; a failed unlock only delays the next sweep
        if let Err(err) = versions.unlock(SWEEPER_LOCK).await {
            warn!("Failed to release the IP item sweeper lock: {err}");
        }
        let n = result?;
        if n > 0 {
            info!("Swept {n} stale IP items");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        entities::{NodeId, PolicyId, VersionLock},
        sqlite::{test_support::scratch, Session},
    };

    fn lists(session: &Session, grace_period: Duration) -> IpLists {
        let session = Arc::new(session.clone());
        let instruments = Arc::new(Instruments::new("edgeplane"));
        let versions = Arc::new(VersionLocks::new(
            session.clone(),
            versions::Config::default(),
            instruments.clone(),
        ));
        let tasks = Arc::new(NodeTasks::new(
            session.clone(),
            session.clone(),
            versions.clone(),
            instruments.clone(),
        ));
        IpLists::new(
            session,
            versions,
            tasks,
            Config {
                grace_period,
                sweep_interval: Duration::from_secs(60),
            },
            instruments,
        )
    }

    fn draft(list_id: ListId, ip_from: &str) -> IpItemDraft {
        IpItemDraft {
            list_id,
            ip_from: ip_from.to_owned(),
            reason: "scanner".to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn validation() {
        assert_eq!(
            validate("10.0.0.1", "", None).unwrap().item_type,
            IpItemType::Ipv4
        );
        assert_eq!(
            validate("::1", "::ff", None).unwrap().item_type,
            IpItemType::Ipv6
        );
        assert_eq!(
            validate("", "", Some(IpItemType::All)).unwrap().item_type,
            IpItemType::All
        );
        // Addresses come back in the form they're stored in
        assert_eq!(
            validate(" 10.0.0.1 ", "10.0.0.9\n", None).unwrap(),
            Checked {
                item_type: IpItemType::Ipv4,
                ip_from: "10.0.0.1".to_owned(),
                ip_to: "10.0.0.9".to_owned(),
            }
        );
        assert_eq!(
            validate("2001:DB8:0:0::1", "", None).unwrap().ip_from,
            "2001:db8::1"
        );
        assert!(matches!(
            validate("10.0.0.9", "10.0.0.1", None),
            Err(Error::BadRange { .. })
        ));
        assert!(matches!(
            validate("10.0.0.1", "::1", None),
            Err(Error::FamilyMismatch { .. })
        ));
        assert!(matches!(
            validate("10.0.0.1", "", Some(IpItemType::Ipv6)),
            Err(Error::FamilyMismatch { .. })
        ));
        assert!(matches!(
            validate("not-an-ip", "", None),
            Err(Error::BadIp { .. })
        ));
        assert!(matches!(validate(" ", "", None), Err(Error::MissingIp { .. })));
    }

    #[tokio::test]
    async fn lists_must_exist_and_be_enabled() {
        let (_dir, session) = scratch().await;
        let lists = lists(&session, Duration::from_secs(60));
        assert!(matches!(
            lists.create_ip_item(&draft(ListId::new(99), "10.0.0.1")).await,
            Err(Error::NoSuchList { .. })
        ));
        let list = session.create_ip_list("black", false).await.unwrap();
        session.set_ip_list_enabled(list, false).await.unwrap();
        assert!(matches!(
            lists.create_ip_item(&draft(list, "10.0.0.1")).await,
            Err(Error::ListDisabled { .. })
        ));
    }

    #[tokio::test]
    async fn mutations_notify_enforcing_clusters() {
        let (_dir, session) = scratch().await;
        let lists = lists(&session, Duration::from_secs(60));
        let list = session.create_ip_list("black", false).await.unwrap();
        let (enforcing, bystander) = (ClusterId::new(1), ClusterId::new(2));
        session
            .put_cluster(enforcing, PolicyId::new(10), true)
            .await
            .unwrap();
        session
            .put_cluster(bystander, PolicyId::new(20), true)
            .await
            .unwrap();
        session.attach_ip_list(PolicyId::new(10), list).await.unwrap();
        session
            .put_node(NodeId::new(100), enforcing, Role::Node, true)
            .await
            .unwrap();
        session
            .put_node(NodeId::new(200), bystander, Role::Node, true)
            .await
            .unwrap();

        let id = lists.create_ip_item(&draft(list, "192.0.2.7")).await.unwrap();
        assert_eq!(
            lists.tasks.extract_all_cluster_tasks(Role::Node).await.unwrap(),
            1
        );
        let doing = lists
            .tasks
            .find_doing_node_tasks(Role::Node, NodeId::new(100), 0)
            .await
            .unwrap();
        assert_eq!(doing.len(), 1);
        assert_eq!(doing[0].task_type, NodeTaskType::IpItemChanged);
        assert!(lists
            .tasks
            .find_doing_node_tasks(Role::Node, NodeId::new(200), 0)
            .await
            .unwrap()
            .is_empty());

        // A global list reaches every enabled cluster
        let global = session.create_ip_list("black", true).await.unwrap();
        assert_eq!(lists.notify_update(global).await.unwrap(), 2);

        assert!(lists.disable_ip_item(id).await.unwrap());
        assert!(!lists.disable_ip_item(id).await.unwrap());
        assert!(lists.find_enabled_ip_item(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn addresses_are_stored_canonically() {
        let (_dir, session) = scratch().await;
        let lists = lists(&session, Duration::from_secs(60));
        let list = session.create_ip_list("black", false).await.unwrap();

        let id = lists.create_ip_item(&draft(list, " 10.0.0.1 ")).await.unwrap();
        let item = lists.find_ip_item(id).await.unwrap().unwrap();
        assert_eq!(item.ip_from, "10.0.0.1");
        assert_eq!(item.ip_to, "");
        let delta = lists.list_ip_items_after_version(0, 10).await.unwrap();
        assert_eq!(delta[0].ip_from, "10.0.0.1");

        assert_eq!(
            lists
                .disable_ip_items_with_ip(None, "10.0.0.1", "")
                .await
                .unwrap(),
            1
        );
        assert!(lists.find_enabled_ip_item(id).await.unwrap().is_none());

        // ...and the match works the other way round, too
        let id = lists.create_ip_item(&draft(list, "10.0.0.2")).await.unwrap();
        lists
            .update_ip_item(
                id,
                &IpItemUpdate {
                    ip_from: "10.0.0.2\t".to_owned(),
                    ip_to: " 10.0.0.20".to_owned(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let item = lists.find_ip_item(id).await.unwrap().unwrap();
        assert_eq!((item.ip_from.as_str(), item.ip_to.as_str()), ("10.0.0.2", "10.0.0.20"));
        assert_eq!(
            lists
                .disable_ip_items_with_ip(Some(list), " 10.0.0.2", "10.0.0.20 ")
                .await
                .unwrap(),
            1
        );
        assert!(matches!(
            lists.disable_ip_items_with_ip(None, "10.0.0", "").await,
            Err(Error::BadIp { .. })
        ));
    }

    /// Hard-deletes every expired item just before applying an update, as a concurrent sweep would
    struct SweptMidUpdate(Session);

    #[async_trait]
    impl Backend for SweptMidUpdate {
        async fn select_ip_list(&self, id: ListId) -> storage::Result<Option<IpList>> {
            self.0.select_ip_list(id).await
        }
        async fn insert_ip_item(
            &self,
            draft: &IpItemDraft,
            item_type: IpItemType,
            version: u64,
            now: i64,
        ) -> storage::Result<ItemId> {
            self.0.insert_ip_item(draft, item_type, version, now).await
        }
        async fn update_ip_item(
            &self,
            id: ItemId,
            update: &IpItemUpdate,
            item_type: IpItemType,
            version: u64,
            now: i64,
        ) -> storage::Result<bool> {
            self.0.delete_stale_items(0, i64::MAX).await?;
            self.0
                .update_ip_item(id, update, item_type, version, now)
                .await
        }
        async fn select_ip_item(&self, id: ItemId) -> storage::Result<Option<IpItem>> {
            self.0.select_ip_item(id).await
        }
        async fn disable_ip_item(
            &self,
            id: ItemId,
            version: u64,
            now: i64,
        ) -> storage::Result<bool> {
            self.0.disable_ip_item(id, version, now).await
        }
        async fn select_enabled_item_ids(
            &self,
            filter: &ItemFilter,
        ) -> storage::Result<Vec<(ItemId, ListId)>> {
            self.0.select_enabled_item_ids(filter).await
        }
        async fn select_items_after_version(
            &self,
            since: u64,
            size: usize,
        ) -> storage::Result<Vec<IpItem>> {
            self.0.select_items_after_version(since, size).await
        }
        async fn select_enabled_items_with_list_id(
            &self,
            list_id: ListId,
            offset: usize,
            size: usize,
        ) -> storage::Result<Vec<IpItem>> {
            self.0
                .select_enabled_items_with_list_id(list_id, offset, size)
                .await
        }
        async fn count_enabled_items_with_list_id(&self, list_id: ListId) -> storage::Result<u64> {
            self.0.count_enabled_items_with_list_id(list_id).await
        }
        async fn mark_items_read(&self) -> storage::Result<u64> {
            self.0.mark_items_read().await
        }
        async fn count_unread_items(&self) -> storage::Result<u64> {
            self.0.count_unread_items().await
        }
        async fn delete_stale_items(
            &self,
            disabled_before: i64,
            expired_before: i64,
        ) -> storage::Result<u64> {
            self.0
                .delete_stale_items(disabled_before, expired_before)
                .await
        }
        async fn find_enabled_cluster_ids_with_ip_list(
            &self,
            list_id: ListId,
        ) -> storage::Result<Vec<ClusterId>> {
            self.0.find_enabled_cluster_ids_with_ip_list(list_id).await
        }
    }

    #[tokio::test]
    async fn updating_a_vanished_item_fails() {
        let (_dir, session) = scratch().await;
        let template = lists(&session, Duration::from_secs(60));
        let lists = IpLists::new(
            Arc::new(SweptMidUpdate(session.clone())),
            template.versions.clone(),
            template.tasks.clone(),
            template.config.clone(),
            template.instruments.clone(),
        );
        let list = session.create_ip_list("black", false).await.unwrap();
        let mut expired = draft(list, "10.0.0.1");
        expired.expired_at = 1;
        let id = lists.create_ip_item(&expired).await.unwrap();
        assert!(matches!(
            lists
                .update_ip_item(
                    id,
                    &IpItemUpdate {
                        ip_from: "10.0.0.1".to_owned(),
                        ..Default::default()
                    }
                )
                .await,
            Err(Error::NoSuchItem { .. })
        ));
        assert!(lists.find_ip_item(id).await.unwrap().is_none());
    }

    /// Version locks that can be taken but never released
    struct Unreleasable(Session);

    #[async_trait]
    impl versions::Backend for Unreleasable {
        async fn select_version_lock(&self, key: &str) -> storage::Result<Option<VersionLock>> {
            versions::Backend::select_version_lock(&self.0, key).await
        }
        async fn insert_version_lock(
            &self,
            key: &str,
            version: u64,
            timeout_at: i64,
        ) -> storage::Result<()> {
            versions::Backend::insert_version_lock(&self.0, key, version, timeout_at).await
        }
        async fn advance_version(
            &self,
            key: &str,
            expected: u64,
            step: u64,
            timeout_at: Option<i64>,
        ) -> storage::Result<bool> {
            versions::Backend::advance_version(&self.0, key, expected, step, timeout_at).await
        }
        async fn expire_version_lock(&self, _key: &str, _timeout_at: i64) -> storage::Result<()> {
            Err(storage::Error::new(
                storage::Kind::Other,
                std::io::Error::other("read-only"),
            ))
        }
    }

    #[tokio::test]
    async fn failing_to_unlock_does_not_fail_the_sweep() {
        let (_dir, session) = scratch().await;
        let template = lists(&session, Duration::from_secs(60));
        let lists = Arc::new(IpLists::new(
            template.backend.clone(),
            Arc::new(VersionLocks::new(
                Arc::new(Unreleasable(session.clone())),
                versions::Config::default(),
                template.instruments.clone(),
            )),
            template.tasks.clone(),
            template.config.clone(),
            template.instruments.clone(),
        ));
        let list = session.create_ip_list("black", false).await.unwrap();
        let mut expired = draft(list, "10.0.0.1");
        expired.expired_at = 1;
        let id = lists.create_ip_item(&expired).await.unwrap();

        Sweeper::new(lists.clone()).tick().await.unwrap();
        assert!(lists.find_ip_item(id).await.unwrap().is_none());
        // The lock is still held, so a second sweep stands down quietly
        Sweeper::new(lists).tick().await.unwrap();
    }

    #[tokio::test]
    async fn sweeping_respects_the_grace_period() {
        let (_dir, session) = scratch().await;
        let lists = lists(&session, Duration::from_secs(3600));
        let list = session.create_ip_list("black", false).await.unwrap();
        let keep = lists.create_ip_item(&draft(list, "10.0.0.1")).await.unwrap();
        let gone = lists.create_ip_item(&draft(list, "10.0.0.2")).await.unwrap();
        lists.disable_ip_item(gone).await.unwrap();
        // Not yet past the grace period
        assert_eq!(lists.clean_expired_ip_items(Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(lists.clean_expired_ip_items(later).await.unwrap(), 1);
        assert!(lists.find_ip_item(gone).await.unwrap().is_none());
        assert!(lists.find_ip_item(keep).await.unwrap().is_some());

        let sweeper = Sweeper::new(Arc::new(lists));
        sweeper.tick().await.unwrap();
    }
}
