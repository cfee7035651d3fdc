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

//! Integration tests for version sequences & locks across controllers.

use std::time::Duration;

use itertools::Itertools;
use libtest_mimic::Failed;
use tracing::debug;

use crate::Fixture;

/// Two controllers hammering one sequence between them hand out every value exactly once
pub async fn sequences_have_no_gaps_or_duplicates(fixture: Fixture) -> Result<(), Failed> {
    const WRITERS: usize = 2;
    const INCREMENTS: usize = 25;

    let peer = fixture.peer().await?;
    let mut handles = Vec::new();
    for versions in [&fixture.controller.versions, &peer.versions] {
        for _ in 0..WRITERS {
            let versions = versions.clone();
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::with_capacity(INCREMENTS);
                for _ in 0..INCREMENTS {
                    seen.push(versions.increase("SEQUENCE", 1).await?);
                }
                Ok::<Vec<u64>, edgeplane::versions::Error>(seen)
            }));
        }
    }

    let mut all = Vec::new();
    for handle in handles {
        let seen = handle.await??;
        // Each writer sees its own values strictly increase
        assert!(seen.iter().tuple_windows().all(|(a, b)| a < b));
        all.extend(seen);
    }
    let n = (2 * WRITERS * INCREMENTS) as u64;
    assert_eq!(all.into_iter().sorted().collect::<Vec<_>>(), (1..=n).collect::<Vec<_>>());
    assert_eq!(peer.versions.read("SEQUENCE").await?, Some(n));

    peer.close().await;
    Ok(())
}

/// A lock admits one holder at a time, and can be taken over once its holder's timeout lapses
pub async fn locks_exclude_then_expire(fixture: Fixture) -> Result<(), Failed> {
    let a = &fixture.controller.versions;
    let peer = fixture.peer().await?;
    let b = &peer.versions;

    assert!(a.lock("JANITOR", Duration::from_secs(1)).await?);
    assert!(!b.lock("JANITOR", Duration::from_secs(1)).await?);
    assert!(!a.lock("JANITOR", Duration::from_secs(1)).await?);

    // a "crashes" without unlocking
    debug!("Waiting out the lock timeout...");
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(b.lock("JANITOR", Duration::from_secs(60)).await?);
    assert!(!a.lock("JANITOR", Duration::from_secs(60)).await?);

    b.unlock("JANITOR").await?;
    assert!(a.lock("JANITOR", Duration::from_secs(60)).await?);

    // Lock traffic advances the version like any other sequence
    assert_eq!(a.read("JANITOR").await?, Some(3));
    assert_eq!(a.read("NEVER_USED").await?, None);

    peer.close().await;
    Ok(())
}
