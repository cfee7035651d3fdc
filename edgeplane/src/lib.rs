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

//! # edgeplane
//!
//! The persistence & replication layer of a CDN control plane: the machinery that keeps a fleet of
//! independently polling edge nodes eventually consistent with central state.
//!
//! - [versions]: named, monotonic sequence numbers that double as self-expiring locks
//! - [node_tasks]: the per-node (and per-cluster) "something changed" queue
//! - [ip_lists]: IP list items, versioned for incremental replication
//! - [access_logs] & [db_pool]: day-partitioned, size-capped access-log tables spread over a
//!   reconfigurable set of log databases
//!
//! Every component talks to its datastore through a small, object-safe trait; [sqlite] implements
//! all of them.
pub mod access_logs;
pub mod db_pool;
pub mod entities;
pub mod ip_lists;
pub mod metrics;
pub mod node_tasks;
pub mod periodic;
pub mod sqlite;
pub mod storage;
pub mod versions;
