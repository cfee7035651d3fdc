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

//! # edgeplane entities
//!
//! The types that flow between the control plane's datastore & the rest of the crate: identifiers,
//! node roles, task types, the replicated rows themselves and the day keys used to partition
//! access logs.
//!
//! Most identifiers are just integer primary keys in the datastore; I give each its own newtype so
//! that, say, a [NodeId] can't be handed to something expecting a [ClusterId].

use std::{fmt::Display, net::IpAddr, str::FromStr};

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a valid day key (expected YYYYMMDD)"))]
    BadDay { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a valid IP item type"))]
    BadItemType { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a recognized node role"))]
    BadRole { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a recognized node task type"))]
    BadTaskType { text: String, backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            pub const fn new(id: i64) -> $name {
                $name(id)
            }
            pub fn get(&self) -> i64 {
                self.0
            }
            pub fn is_zero(&self) -> bool {
                self.0 == 0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                $name(id)
            }
        }
    };
}

define_id!(
    /// An edge (or DNS) node
    NodeId
);
define_id!(
    /// A cluster of nodes sharing configuration
    ClusterId
);
define_id!(
    /// A server (site) configured on the platform; zero means "no server scope"
    ServerId
);
define_id!(
    /// An IP (reputation) list
    ListId
);
define_id!(
    /// A single item in an IP list
    ItemId
);
define_id!(NodeTaskId);
define_id!(
    /// A log-database backend target
    DbNodeId
);
define_id!(
    /// An HTTP firewall policy
    PolicyId
);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         roles & types                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The role a process plays in the fleet
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// A CDN edge node
    Node,
    /// An authoritative DNS node
    Dns,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Node => "node",
            Role::Dns => "dns",
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "node" => Ok(Role::Node),
            "dns" => Ok(Role::Dns),
            _ => BadRoleSnafu { text: s.to_owned() }.fail(),
        }
    }
}

/// The sorts of work a node may be asked to carry out
///
/// A task carries no payload: it tells the node *what* changed, and the node then pulls the
/// relevant state through the usual read APIs.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeTaskType {
    ConfigChanged,
    IpItemChanged,
    NodeVersionChanged,
    ScriptsChanged,
    NodeLevelChanged,
    DdosProtectionChanged,
    GlobalServerConfigChanged,
    DnsConfigChanged,
}

impl NodeTaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeTaskType::ConfigChanged => "config_changed",
            NodeTaskType::IpItemChanged => "ip_item_changed",
            NodeTaskType::NodeVersionChanged => "node_version_changed",
            NodeTaskType::ScriptsChanged => "scripts_changed",
            NodeTaskType::NodeLevelChanged => "node_level_changed",
            NodeTaskType::DdosProtectionChanged => "ddos_protection_changed",
            NodeTaskType::GlobalServerConfigChanged => "global_server_config_changed",
            NodeTaskType::DnsConfigChanged => "dns_config_changed",
        }
    }
}

impl Display for NodeTaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeTaskType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "config_changed" => Ok(NodeTaskType::ConfigChanged),
            "ip_item_changed" => Ok(NodeTaskType::IpItemChanged),
            "node_version_changed" => Ok(NodeTaskType::NodeVersionChanged),
            "scripts_changed" => Ok(NodeTaskType::ScriptsChanged),
            "node_level_changed" => Ok(NodeTaskType::NodeLevelChanged),
            "ddos_protection_changed" => Ok(NodeTaskType::DdosProtectionChanged),
            "global_server_config_changed" => Ok(NodeTaskType::GlobalServerConfigChanged),
            "dns_config_changed" => Ok(NodeTaskType::DnsConfigChanged),
            _ => BadTaskTypeSnafu { text: s.to_owned() }.fail(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         version locks                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A named, monotonically increasing counter doubling as a timeout-based lock
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionLock {
    pub key: String,
    pub version: u64,
    /// Unix seconds; the lock is held iff `now <= timeout_at`
    pub timeout_at: i64,
}

impl VersionLock {
    pub fn is_held_at(&self, now: i64) -> bool {
        now <= self.timeout_at
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           node tasks                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A pending (or completed) unit of work for a node, or for every node in a cluster
///
/// A `node_id` of zero denotes a cluster-scoped row that has not yet been extracted into per-node
/// rows.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeTask {
    pub id: NodeTaskId,
    pub role: Role,
    pub cluster_id: ClusterId,
    pub node_id: NodeId,
    pub server_id: ServerId,
    pub task_type: NodeTaskType,
    pub unique_id: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub is_done: bool,
    pub is_ok: bool,
    pub error: String,
    pub is_notified: bool,
}

impl NodeTask {
    pub fn is_cluster_scoped(&self) -> bool {
        self.node_id.is_zero()
    }
}

/// The key under which a node-level task is upserted
pub fn node_task_unique_id(
    role: Role,
    node_id: NodeId,
    server_id: ServerId,
    task_type: NodeTaskType,
) -> String {
    format!("{role}@node@{node_id}@{server_id}@{task_type}")
}

/// The key under which a cluster-level task is upserted
pub fn cluster_task_unique_id(
    role: Role,
    cluster_id: ClusterId,
    server_id: ServerId,
    task_type: NodeTaskType,
) -> String {
    format!("{role}@cluster@{cluster_id}@{server_id}@{task_type}")
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            IP lists                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An IP list; items hang off of these
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IpList {
    pub id: ListId,
    /// "black", "white", "grey"; opaque to this crate
    pub list_type: String,
    /// Global lists apply to every cluster
    pub is_global: bool,
    pub is_enabled: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IpItemType {
    Ipv4,
    Ipv6,
    /// Matches every address; `ip_from` & `ip_to` are ignored
    All,
}

impl IpItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpItemType::Ipv4 => "ipv4",
            IpItemType::Ipv6 => "ipv6",
            IpItemType::All => "all",
        }
    }
    /// Does `addr` belong to the address family this type describes?
    pub fn admits(&self, addr: &IpAddr) -> bool {
        match self {
            IpItemType::Ipv4 => addr.is_ipv4(),
            IpItemType::Ipv6 => addr.is_ipv6(),
            IpItemType::All => true,
        }
    }
}

impl Display for IpItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IpItemType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ipv4" => Ok(IpItemType::Ipv4),
            "ipv6" => Ok(IpItemType::Ipv6),
            "all" => Ok(IpItemType::All),
            _ => BadItemTypeSnafu { text: s.to_owned() }.fail(),
        }
    }
}

/// Logical state of a replicated row; disabling is a soft delete
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum IpItemState {
    Enabled,
    Disabled,
}

impl IpItemState {
    pub fn as_i64(&self) -> i64 {
        match self {
            IpItemState::Enabled => 1,
            IpItemState::Disabled => 0,
        }
    }
    pub fn from_i64(x: i64) -> IpItemState {
        if x == 1 {
            IpItemState::Enabled
        } else {
            IpItemState::Disabled
        }
    }
}

/// A replicated IP list item
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IpItem {
    pub id: ItemId,
    pub list_id: ListId,
    pub ip_from: String,
    /// Empty for single-address items
    pub ip_to: String,
    pub item_type: IpItemType,
    /// Stamped from the global `IP_ITEM_VERSION` sequence on every mutation
    pub version: u64,
    /// Unix seconds; zero means "never"
    pub expired_at: i64,
    pub state: IpItemState,
    pub reason: String,
    pub event_level: String,
    pub source_node_id: NodeId,
    pub source_server_id: ServerId,
    pub source_policy_id: PolicyId,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to create an [IpItem]
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct IpItemDraft {
    pub list_id: ListId,
    pub ip_from: String,
    pub ip_to: String,
    pub item_type: Option<IpItemType>,
    pub expired_at: i64,
    pub reason: String,
    pub event_level: String,
    pub source_node_id: NodeId,
    pub source_server_id: ServerId,
    pub source_policy_id: PolicyId,
}

/// The mutable parts of an [IpItem]
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct IpItemUpdate {
    pub ip_from: String,
    pub ip_to: String,
    pub item_type: Option<IpItemType>,
    pub expired_at: i64,
    pub reason: String,
    pub event_level: String,
}

/// Predicate selecting items for a bulk disable
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ItemFilter {
    /// Every enabled item in a list
    List(ListId),
    /// Enabled items matching an address (range), optionally restricted to one list
    Ip {
        list_id: Option<ListId>,
        ip_from: String,
        ip_to: String,
    },
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          access logs                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A day key, rendered as `YYYYMMDD`
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Day(NaiveDate);

impl Day {
    pub fn new(date: NaiveDate) -> Day {
        Day(date)
    }
    pub fn today() -> Day {
        Day(Utc::now().date_naive())
    }
    pub fn of(dt: &DateTime<Utc>) -> Day {
        Day(dt.date_naive())
    }
    pub fn date(&self) -> NaiveDate {
        self.0
    }
    /// This day, `days` days ago; `None` if that's before the earliest representable date
    pub fn minus_days(&self, days: u64) -> Option<Day> {
        self.0.checked_sub_days(chrono::Days::new(days)).map(Day)
    }
}

impl Display for Day {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04}{:02}{:02}",
            self.0.year(),
            self.0.month(),
            self.0.day()
        )
    }
}

impl FromStr for Day {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return BadDaySnafu { text: s.to_owned() }.fail();
        }
        NaiveDate::parse_from_str(s, "%Y%m%d")
            .ok()
            .map(Day)
            .context(BadDaySnafu { text: s.to_owned() })
    }
}

/// One HTTP access log entry, as reported by an edge node
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AccessLog {
    /// Assigned by the log table; zero on entries not yet written
    pub id: i64,
    pub server_id: ServerId,
    pub node_id: NodeId,
    pub status: u16,
    pub created_at: DateTime<Utc>,
    pub request_id: String,
    pub remote_addr: String,
    pub domain: String,
    /// The full entry, serialized by the edge node; opaque here
    pub content: String,
}

impl AccessLog {
    pub fn day(&self) -> Day {
        Day::of(&self.created_at)
    }
}

/// Filters for reading access logs back
#[derive(Clone, Debug)]
pub struct LogQuery {
    pub day: Day,
    pub server_id: Option<ServerId>,
    pub node_id: Option<NodeId>,
    /// Only entries with a status of 400 or above
    pub errors_only: bool,
    pub size: usize,
}

impl LogQuery {
    pub fn new(day: Day, size: usize) -> LogQuery {
        LogQuery {
            day,
            server_id: None,
            node_id: None,
            errors_only: false,
            size,
        }
    }
}

/// A configured log-database backend target
#[derive(Clone, Debug)]
pub struct DbNode {
    pub id: DbNodeId,
    pub name: String,
    /// Driver connection URL (`sqlite:/var/lib/edgeplane/logs-1.db`, e.g.)
    pub url: String,
    pub username: String,
    pub password: SecretString,
}

impl DbNode {
    /// Two targets with the same connection parameters may share a connection
    pub fn same_connection(&self, other: &DbNode) -> bool {
        self.url == other.url
            && self.username == other.username
            && self.password.expose_secret() == other.password.expose_secret()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn days() {
        let day = "20261019".parse::<Day>().unwrap();
        assert_eq!(day.to_string(), "20261019");
        assert_eq!(day.minus_days(19).unwrap().to_string(), "20260930");
        assert_eq!(day.minus_days(0), Some(day));
        assert_eq!(day.minus_days(100_000_000), None);
        assert_eq!(day.minus_days(u64::MAX), None);
        assert!("2026109".parse::<Day>().is_err());
        assert!("20261332".parse::<Day>().is_err());
        assert!("2026-10-1".parse::<Day>().is_err());
    }

    #[test]
    fn unique_ids() {
        let node = node_task_unique_id(
            Role::Node,
            NodeId::new(7),
            ServerId::default(),
            NodeTaskType::IpItemChanged,
        );
        let cluster = cluster_task_unique_id(
            Role::Node,
            ClusterId::new(7),
            ServerId::default(),
            NodeTaskType::IpItemChanged,
        );
        assert_eq!(node, "node@node@7@0@ip_item_changed");
        assert_ne!(node, cluster);
    }

    #[test]
    fn round_trip_names() {
        for t in [
            NodeTaskType::ConfigChanged,
            NodeTaskType::IpItemChanged,
            NodeTaskType::DnsConfigChanged,
        ] {
            assert_eq!(t.as_str().parse::<NodeTaskType>().unwrap(), t);
        }
        assert_eq!("dns".parse::<Role>().unwrap(), Role::Dns);
        assert!("edge".parse::<Role>().is_err());
        assert!(IpItemType::Ipv4.admits(&"10.0.0.1".parse().unwrap()));
        assert!(!IpItemType::Ipv4.admits(&"::1".parse().unwrap()));
    }
}
