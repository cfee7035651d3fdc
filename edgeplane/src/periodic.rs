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

//! # Periodic background jobs
//!
//! Several parts of edgeplane need to do something "every so often": expand cluster-level tasks
//! into node-level tasks, sweep expired IP items, reconcile the log-database pool against its
//! configuration, drop old log tables. Each of those is expressed as a [Job]: a named thing with a
//! single async method, [tick](Job::tick), that performs *one* iteration of the work.
//!
//! [spawn] then runs a [Job] on a fixed period in its own tokio task, returning a [Processor] that
//! can be used to stop it. Splitting things this way means that tests never need to wait on a
//! timer: they just call `tick()` themselves.
//!
//! A failed tick is logged & counted, but doesn't stop the loop; the next tick is as likely to
//! succeed as any other.

use std::{future::Future, pin::Pin, sync::Arc, task::Poll, time::Duration};

use async_trait::async_trait;
use pin_project::pin_project;
use snafu::{prelude::*, Backtrace};
use tokio::{
    sync::Notify,
    task::{JoinError, JoinHandle},
    time::MissedTickBehavior,
};
use tracing::{debug, warn};

use crate::{
    counter_add,
    metrics::{self, Instruments, Sort},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Job {name} failed to run to completion: {source}"))]
    Join {
        name: &'static str,
        source: JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("Timeout shutting-down job {name}: {source}"))]
    ShutdownTimeout {
        name: &'static str,
        source: tokio::time::error::Elapsed,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The error type a [Job] may fail with; each job has its own module error & we just log it
pub type JobError = Box<dyn std::error::Error + Send + Sync + 'static>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Job                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One unit of periodic work
#[async_trait]
pub trait Job: Send + Sync {
    /// A short, stable name used in logs & metric attributes
    fn name(&self) -> &'static str;
    /// Carry out a single iteration
    async fn tick(&self) -> std::result::Result<(), JobError>;
}

#[async_trait]
impl<T: Job + ?Sized> Job for Arc<T> {
    fn name(&self) -> &'static str {
        self.as_ref().name()
    }
    async fn tick(&self) -> std::result::Result<(), JobError> {
        self.as_ref().tick().await
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Processor                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Handle on a running [Job]
///
/// Resolves (as a [Future]) when the job's loop exits; [shutdown](Processor::shutdown) asks it to.
#[pin_project]
pub struct Processor {
    name: &'static str,
    #[pin]
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl Future for Processor {
    type Output = std::result::Result<(), JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.handle.poll(cx)
    }
}

impl Processor {
    pub fn name(&self) -> &'static str {
        self.name
    }
    /// Signal the loop to exit & wait up to `timeout` for it to do so
    ///
    /// A tick already in progress is allowed to finish.
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        let name = self.name;
        self.shutdown.notify_one();
        tokio::time::timeout(timeout, self.handle)
            .await
            .context(ShutdownTimeoutSnafu { name })?
            .context(JoinSnafu { name })
    }
}

inventory::submit! { metrics::Registration::new("periodic.ticks", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("periodic.ticks.failed", Sort::IntegralCounter) }

async fn run<J: Job>(job: J, period: Duration, shutdown: Arc<Notify>, instruments: Arc<Instruments>) {
    let attrs = [opentelemetry::KeyValue::new("job", job.name())];
    let mut interval = tokio::time::interval(period);
    // A slow tick shouldn't be followed by a burst of catch-up ticks.
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match job.tick().await {
                    Ok(_) => {
                        counter_add!(instruments, "periodic.ticks", 1, &attrs);
                    }
                    Err(err) => {
                        warn!("Job {} failed: {}", job.name(), err);
                        counter_add!(instruments, "periodic.ticks.failed", 1, &attrs);
                    }
                }
            },
            _ = shutdown.notified() => {
                break;
            }
        }
    }
    debug!("Job {} exiting.", job.name());
}

/// Run `job` every `period` until the returned [Processor] is shut down; the first tick happens
/// immediately.
pub fn spawn<J: Job + 'static>(job: J, period: Duration, instruments: Arc<Instruments>) -> Processor {
    let name = job.name();
    let shutdown = Arc::new(Notify::new());
    let handle = tokio::spawn(run(job, period, shutdown.clone(), instruments));
    Processor {
        name,
        handle,
        shutdown,
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Counting {
        ticks: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Job for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }
        async fn tick(&self) -> std::result::Result<(), JobError> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err("nope".into())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn ticks_until_shutdown() {
        let job = Arc::new(Counting {
            ticks: AtomicUsize::new(0),
            fail: false,
        });
        let processor = spawn(
            job.clone(),
            Duration::from_millis(10),
            Arc::new(Instruments::new("edgeplane")),
        );
        assert_eq!(processor.name(), "counting");
        tokio::time::sleep(Duration::from_millis(55)).await;
        processor.shutdown(Duration::from_secs(1)).await.unwrap();
        let seen = job.ticks.load(Ordering::SeqCst);
        assert!(seen >= 2);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(seen, job.ticks.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_loop() {
        let job = Arc::new(Counting {
            ticks: AtomicUsize::new(0),
            fail: true,
        });
        let processor = spawn(
            job.clone(),
            Duration::from_millis(10),
            Arc::new(Instruments::new("edgeplane")),
        );
        tokio::time::sleep(Duration::from_millis(55)).await;
        processor.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(job.ticks.load(Ordering::SeqCst) >= 2);
    }
}
