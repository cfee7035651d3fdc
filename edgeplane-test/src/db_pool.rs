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

//! Integration tests for the log-database pool.

use edgeplane::{
    access_logs::{Shard, TableManager},
    db_pool::Reconciled,
    entities::LogQuery,
};
use libtest_mimic::Failed;
use secrecy::SecretString;

use crate::{
    access_logs::{day, log},
    Fixture,
};

/// Rows stored for [day] on `shard`, across partitions
async fn stored(tables: &TableManager, shard: &Shard) -> Result<u64, Failed> {
    let mut rows = 0;
    for table in tables.find_tables(shard, day()).await? {
        rows += shard.backend.count_rows(&table).await?;
    }
    Ok(rows)
}

/// Logs land on the configured log databases, stay readable as the set changes, and stop going
/// to a database once it's switched off
pub async fn logs_follow_the_configured_databases(fixture: Fixture) -> Result<(), Failed> {
    let control = &fixture.controller;
    let password = SecretString::from("hunter2".to_owned());
    let a = control
        .session
        .put_db_node("logs-a", &fixture.sibling_url("logs-a.db"), "edge", &password, true)
        .await?;
    control
        .session
        .put_db_node("logs-b", &fixture.sibling_url("logs-b.db"), "edge", &password, true)
        .await?;

    assert_eq!(
        control.pool.reconcile().await?,
        Reconciled {
            opened: 2,
            closed: 0,
            failed: 0
        }
    );

    for minute in 0..8 {
        control.logs.create_access_logs(&[log(minute, 200)]).await?;
    }
    let live = control.pool.live().await;
    assert_eq!(live.len(), 2);
    // Nothing goes to the control datastore while log databases are available
    assert!(control
        .tables
        .find_tables(&control.default_shard(), day())
        .await?
        .is_empty());
    let mut total = 0;
    for shard in &live {
        total += stored(&control.tables, shard).await?;
    }
    assert_eq!(total, 8);
    assert_eq!(
        control
            .logs
            .list_access_logs(&LogQuery::new(day(), 100))
            .await?
            .len(),
        8
    );

    // A second controller discovers the same databases
    let peer = fixture.peer().await?;
    assert_eq!(peer.pool.reconcile().await?.opened, 2);
    assert_eq!(
        peer.logs
            .list_access_logs(&LogQuery::new(day(), 100))
            .await?
            .len(),
        8
    );

    // Switch one off; new logs all go to the other
    control
        .session
        .update_db_node(a, &fixture.sibling_url("logs-a.db"), false)
        .await?;
    let changed = control.pool.reconcile().await?;
    assert_eq!((changed.opened, changed.closed), (0, 1));
    let remaining = control.pool.live().await;
    assert_eq!(remaining.len(), 1);
    let before = stored(&control.tables, &remaining[0]).await?;
    control.logs.create_access_logs(&[log(9, 503)]).await?;
    assert_eq!(stored(&control.tables, &remaining[0]).await?, before + 1);

    peer.close().await;
    Ok(())
}
