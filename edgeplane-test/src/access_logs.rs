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

//! Integration tests for partitioned access-log storage.

use chrono::{NaiveDate, TimeZone, Utc};
use edgeplane::{
    access_logs::table_name,
    entities::{AccessLog, Day, LogQuery, NodeId, ServerId},
};
use libtest_mimic::Failed;

use crate::{Fixture, ROWS_PER_TABLE};

pub(crate) fn day() -> Day {
    Day::new(NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(/* known good */))
}

/// A log for [day], `minute` minutes past noon
pub(crate) fn log(minute: u32, status: u16) -> AccessLog {
    AccessLog {
        id: 0,
        server_id: ServerId::new(11),
        node_id: NodeId::new(12),
        status,
        created_at: Utc.from_utc_datetime(&day().date().and_hms_opt(12, minute, 0).unwrap()),
        request_id: format!("req-{minute}"),
        remote_addr: "203.0.113.9".to_owned(),
        domain: "www.example.com".to_owned(),
        content: format!(r#"{{"minute":{minute}}}"#),
    }
}

/// Writes from two controllers fill each table to capacity before moving on to the next partition
pub async fn tables_roll_over(fixture: Fixture) -> Result<(), Failed> {
    let control = &fixture.controller;
    let shard = control.default_shard();
    assert_eq!(ROWS_PER_TABLE, 2);

    for minute in 0..3 {
        assert_eq!(control.logs.create_access_logs(&[log(minute, 200)]).await?, 1);
    }
    assert_eq!(
        control.tables.find_tables(&shard, day()).await?,
        vec![table_name(day(), 0), table_name(day(), 1)]
    );
    assert_eq!(shard.backend.count_rows(&table_name(day(), 0)).await?, 2);
    assert_eq!(shard.backend.count_rows(&table_name(day(), 1)).await?, 1);

    // A second controller picks up where the first left off
    let peer = fixture.peer().await?;
    peer.logs.create_access_logs(&[log(3, 404)]).await?;
    assert_eq!(shard.backend.count_rows(&table_name(day(), 1)).await?, 2);
    peer.logs.create_access_logs(&[log(4, 500)]).await?;
    assert_eq!(
        peer.tables.find_tables(&shard, day()).await?,
        vec![
            table_name(day(), 0),
            table_name(day(), 1),
            table_name(day(), 2)
        ]
    );

    // Reads span every partition, newest first
    let all = control.logs.list_access_logs(&LogQuery::new(day(), 100)).await?;
    assert_eq!(
        all.iter().map(|l| l.request_id.as_str()).collect::<Vec<_>>(),
        vec!["req-4", "req-3", "req-2", "req-1", "req-0"]
    );
    let mut errors = LogQuery::new(day(), 100);
    errors.errors_only = true;
    assert_eq!(peer.logs.list_access_logs(&errors).await?.len(), 2);
    assert_eq!(
        peer.logs
            .list_access_logs(&LogQuery::new(day(), 2))
            .await?
            .len(),
        2
    );

    peer.close().await;
    Ok(())
}

/// A table dropped out from under a controller is re-created on the next write
pub async fn dropped_tables_are_recreated(fixture: Fixture) -> Result<(), Failed> {
    let control = &fixture.controller;
    let shard = control.default_shard();

    control.logs.create_access_logs(&[log(0, 200)]).await?;
    // Somebody else (an operator, a retention job) drops today's table...
    shard.backend.drop_table(&table_name(day(), 0)).await?;
    // ...which this controller has cached as existing, with room to spare.
    control.logs.create_access_logs(&[log(1, 200)]).await?;

    let logs = control.logs.list_access_logs(&LogQuery::new(day(), 10)).await?;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].request_id, "req-1");

    // Retention drops whole days
    let earlier = Day::new(NaiveDate::from_ymd_opt(2026, 10, 1).unwrap());
    let mut old = log(0, 200);
    old.created_at = Utc.from_utc_datetime(&earlier.date().and_hms_opt(0, 0, 0).unwrap());
    control.logs.create_access_logs(&[old]).await?;
    assert_eq!(control.logs.drop_tables_before(day()).await?, 1);
    assert!(control.tables.find_tables(&shard, earlier).await?.is_empty());
    assert_eq!(control.tables.find_tables(&shard, day()).await?.len(), 1);

    Ok(())
}
