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

//! # edgeplane integration tests against SQLite
//!
//! Every test gets a fresh datastore in a temporary directory, so unlike tests against a shared
//! database server these can run in any order, and concurrently.

use std::{env, fmt::Display, io, sync::Arc};

use common::Test;
use edgeplane_test::{access_logs, db_pool, ip_lists, node_tasks, versions, Fixture};
use itertools::Itertools;
use libtest_mimic::{Arguments, Trial};
use snafu::prelude::*;
use tokio::runtime::Runtime;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

mod common;

#[derive(Snafu)]
enum Error {
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    Filter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to build a Tokio runtime: {source}"))]
    Runtime { source: std::io::Error },
    #[snafu(display("Failed to set the global tracing subscriber: {source}"))]
    SetGlobalDefault {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

inventory::submit!(Test {
    name: "010versions_no_gaps_or_duplicates",
    test_fn: |fixture| Box::pin(versions::sequences_have_no_gaps_or_duplicates(fixture)),
});

inventory::submit!(Test {
    name: "011versions_locks_exclude_then_expire",
    test_fn: |fixture| Box::pin(versions::locks_exclude_then_expire(fixture)),
});

inventory::submit!(Test {
    name: "020node_tasks_registration_is_idempotent",
    test_fn: |fixture| Box::pin(node_tasks::registration_is_idempotent(fixture)),
});

inventory::submit!(Test {
    name: "021node_tasks_cluster_tasks_reach_every_node",
    test_fn: |fixture| Box::pin(node_tasks::cluster_tasks_reach_every_node(fixture)),
});

inventory::submit!(Test {
    name: "030ip_lists_replicas_converge",
    test_fn: |fixture| Box::pin(ip_lists::replicas_converge(fixture)),
});

inventory::submit!(Test {
    name: "031ip_lists_bulk_disable_stamps_each_row",
    test_fn: |fixture| Box::pin(ip_lists::bulk_disable_stamps_each_row(fixture)),
});

inventory::submit!(Test {
    name: "040access_logs_tables_roll_over",
    test_fn: |fixture| Box::pin(access_logs::tables_roll_over(fixture)),
});

inventory::submit!(Test {
    name: "041access_logs_dropped_tables_are_recreated",
    test_fn: |fixture| Box::pin(access_logs::dropped_tables_are_recreated(fixture)),
});

inventory::submit!(Test {
    name: "050db_pool_logs_follow_the_configured_databases",
    test_fn: |fixture| Box::pin(db_pool::logs_follow_the_configured_databases(fixture)),
});

fn main() -> Result<()> {
    // libtest-mimic wants synchronous test functions, so build the runtime ourselves & block on
    // each test:
    let rt = Arc::new(Runtime::new().context(RuntimeSnafu)?);

    // Only log if asked to
    if env::var_os("RUST_LOG").is_some() {
        let filter = EnvFilter::builder().from_env().context(FilterSnafu)?;
        tracing::subscriber::set_global_default(
            Registry::default()
                .with(fmt::Layer::default().compact().with_writer(io::stdout))
                .with(filter),
        )
        .context(SetGlobalDefaultSnafu)?;
    }

    let args = Arguments::from_args();

    let conclusion = libtest_mimic::run(
        &args,
        inventory::iter::<Test>
            .into_iter()
            .sorted_by_key(|t| t.name)
            .map(|test| {
                Trial::test(test.name, {
                    let rt = rt.clone();
                    move || {
                        rt.block_on(async {
                            let fixture = Fixture::new().await?;
                            (test.test_fn)(fixture).await
                        })
                    }
                })
            })
            .collect(),
    );

    conclusion.exit();
}
