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

//! # edgeplaned
//!
//! The edgeplane controller daemon.
//!
//! edgeplaned opens the control-plane datastore & runs edgeplane's housekeeping on a schedule:
//! expanding cluster-level node tasks, sweeping stale IP items, reconciling the log-database pool
//! and enforcing log retention. Any number of instances may share a datastore; everything they do
//! is coordinated through it.
//!
//! It serves a health check & Prometheus metrics on a private address. `SIGHUP` re-reads the
//! configuration (and re-opens the log file); `SIGTERM` or `SIGINT` shuts down.

use std::{
    fmt::Display,
    fs::OpenOptions,
    future::IntoFuture,
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use axum::{extract::State, http::StatusCode, routing::get, Router};
use clap::{crate_authors, crate_version, value_parser, Arg, ArgAction, Command};
use opentelemetry::{global, KeyValue};
use opentelemetry_prometheus_text_exporter::PrometheusExporter;
use serde::Deserialize;
use snafu::{prelude::*, IntoError};
use tap::Pipe;
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::{mpsc, Notify},
};
use tracing::{debug, error, info, Level};
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    Layer, Registry,
};

use edgeplane::{
    access_logs::{self, AccessLogs, Janitor, Shard, ShardId, TableManager},
    db_pool::{self, DbPool, SqliteConnector},
    entities::Role,
    ip_lists::{self, IpLists, Sweeper},
    metrics::{check_metric_registrations, Instruments},
    node_tasks::{Extractor, NodeTasks},
    periodic::{self, Processor},
    sqlite::{self, Session},
    versions::{self, VersionLocks},
};

/// The edgeplaned application error type
///
/// As with the library's module errors, this is built with [Snafu], but `Debug` is implemented by
/// hand (in terms of `Display`): `main()` returns `Result<(), Error>`, and the runtime prints the
/// `Debug` representation of an error on exit. The derived one is neither readable nor short.
///
/// [Snafu]: https://docs.rs/snafu/latest/snafu/index.html
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind to {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Unable to read configuration file {pth:?}: {source}"))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Error parsing configuration file {pth:?}: {source}"))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("Failed to open the datastore: {source}"))]
    Datastore { source: sqlite::Error },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to open the edgeplane log file: {source}"))]
    LogFile { source: std::io::Error },
    #[snafu(display("Failed to HUP the logfile: {source}"))]
    LogHup {
        source: tokio::sync::mpsc::error::SendError<PathBuf>,
    },
    #[snafu(display("Failed to bring the datastore schema up to date: {source}"))]
    Migrate { source: sqlite::Error },
    #[snafu(display("Failed to install a signal handler: {source}"))]
    Signal { source: std::io::Error },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

/// Logging-related options read from the command line or the environment
struct LogOpts {
    pub foreground: bool,
    pub plain: bool,
    pub level: Level,
}

impl LogOpts {
    fn new(matches: &clap::ArgMatches) -> LogOpts {
        LogOpts {
            foreground: matches.get_flag("foreground"),
            plain: matches.get_flag("plain"),
            level: match (
                matches.get_flag("debug"),
                matches.get_flag("verbose"),
                matches.get_flag("quiet"),
            ) {
                (true, _, _) => Level::TRACE,
                (false, true, _) => Level::DEBUG,
                (false, false, true) => Level::ERROR,
                (_, _, _) => Level::INFO,
            },
        }
    }
}

/// Configuration options read from the CLI (or the environment)
struct CliOpts {
    pub log_opts: LogOpts,
    pub cfg: Option<PathBuf>,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> CliOpts {
        CliOpts {
            log_opts: LogOpts::new(&matches),
            cfg: matches.get_one::<PathBuf>("config").cloned(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize)]
pub struct DatastoreConfig {
    /// sqlx connection URL for the control-plane datastore
    url: String,
    #[serde(rename = "max-connections")]
    max_connections: u32,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        DatastoreConfig {
            url: "sqlite:/var/lib/edgeplane/edgeplane.db".to_owned(),
            max_connections: 8,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct NodeTasksConfig {
    #[serde(rename = "extract-interval")]
    extract_interval: Duration,
    /// Roles whose cluster-level tasks this instance extracts
    roles: Vec<Role>,
}

impl Default for NodeTasksConfig {
    fn default() -> Self {
        NodeTasksConfig {
            extract_interval: Duration::from_secs(2),
            roles: vec![Role::Node, Role::Dns],
        }
    }
}

/// edgeplane configuration, version one
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigV1 {
    #[serde(rename = "log-file")]
    log_file: PathBuf,
    datastore: DatastoreConfig,
    /// Address at which to serve the health check & metrics; specify as "address:port"
    #[serde(rename = "private-address")]
    private_address: Option<SocketAddr>,
    versions: versions::Config,
    #[serde(rename = "node-tasks")]
    node_tasks: NodeTasksConfig,
    #[serde(rename = "ip-lists")]
    ip_lists: ip_lists::Config,
    #[serde(rename = "db-pool")]
    db_pool: db_pool::Config,
    #[serde(rename = "access-logs")]
    access_logs: access_logs::Config,
}

impl ConfigV1 {
    fn log_file(&self) -> PathBuf {
        if self.log_file.as_os_str().is_empty() {
            PathBuf::from("/tmp/edgeplane.log")
        } else {
            self.log_file.clone()
        }
    }
    fn private_address(&self) -> SocketAddr {
        self.private_address
            .unwrap_or(SocketAddr::from(([127, 0, 0, 1], 20690)))
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the edgeplane configuration file
///
/// A missing file is only an error if the operator named it.
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from("/etc/edgeplane.toml"), true),
        |p| (p.clone(), false),
    );
    match std::fs::read_to_string(&pth) {
        Ok(text) => match toml::from_str::<Configuration>(&text) {
            Ok(Configuration::V1(cfg)) => Ok(cfg),
            Err(err) => Err(ConfigParseSnafu { pth }.into_error(err)),
        },
        Err(err) => {
            if defaulted {
                Ok(ConfigV1::default())
            } else {
                Err(ConfigNotFoundSnafu { pth }.into_error(err))
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            logging                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A tracing-compatible, "reopenable" log file
///
/// The [Layer] takes ownership of the [MakeWriter], so re-opening on `SIGHUP` goes through a
/// side-channel: [LogFile::open] hands back the send side of a channel on which the new path is
/// delivered to a task that swaps the file out from under the writer.
struct LogFile {
    fd: Arc<Mutex<std::fs::File>>,
}

impl LogFile {
    pub fn open(pth: &Path) -> StdResult<(LogFile, mpsc::Sender<PathBuf>), std::io::Error> {
        let (tx, rx) = mpsc::channel::<PathBuf>(1);
        let fd = OpenOptions::new()
            .create(true)
            .append(true)
            .open(pth)
            .map(|fd| Arc::new(Mutex::new(fd)))?;
        tokio::spawn(LogFile::rehup(fd.clone(), rx));
        Ok((LogFile { fd }, tx))
    }
    async fn rehup(fd: Arc<Mutex<std::fs::File>>, mut rx: mpsc::Receiver<PathBuf>) {
        while let Some(ref pbuf) = rx.recv().await {
            match OpenOptions::new().create(true).append(true).open(pbuf) {
                Ok(f) => *fd.lock().unwrap_or_else(|p| p.into_inner()) = f,
                Err(err) => error!("Failed to open {:?} ({}).", pbuf, err),
            }
        }
    }
}

pub struct LogFileWriter<'a>(MutexGuard<'a, std::fs::File>);

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogFileWriter<'a>;
    fn make_writer(&'a self) -> Self::Writer {
        // A panic mid-write leaves the file no worse than a torn line.
        LogFileWriter(self.fd.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

impl io::Write for LogFileWriter<'_> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }
    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
    #[inline]
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.write_all(buf)
    }
}

/// Configure edgeplane logging: to stdout when running in the foreground, to the configured log
/// file otherwise (in which case the sender side of its re-open channel is returned, too)
///
/// Can only be invoked once.
#[allow(clippy::type_complexity)]
fn configure_logging(
    logopts: &LogOpts,
    logfile: &Path,
) -> Result<(
    Box<dyn Layer<Registry> + Send + Sync>,
    EnvFilter,
    Option<mpsc::Sender<PathBuf>>,
)> {
    let filter = EnvFilter::builder()
        .with_default_directive(logopts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    //               |  -F=false  |  -F=true     |
    //               |------------+--------------|
    // --plain=false |  json,file |  json,stdout |
    // --plain=true  | !json,file | !json,stdout |
    let mut tx = None;
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if !logopts.foreground {
        let (log_file, tx_inner) = LogFile::open(logfile).context(LogFileSnafu)?;
        tx = Some(tx_inner);
        if logopts.plain {
            Box::new(
                fmt::Layer::default()
                    .compact()
                    .with_ansi(false)
                    .with_writer(log_file),
            )
        } else {
            Box::new(
                fmt::Layer::default()
                    .json()
                    .with_current_span(true)
                    .with_writer(log_file),
            )
        }
    } else if logopts.plain {
        Box::new(fmt::Layer::default().compact().with_writer(io::stdout))
    } else {
        Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(io::stdout),
        )
    };

    Ok((formatter, filter, tx))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        private endpoints                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone)]
struct Private {
    exporter: PrometheusExporter,
}

async fn healthcheck() -> &'static str {
    "GOOD"
}

async fn metrics(State(state): State<Private>) -> (StatusCode, String) {
    let mut output = Vec::new();
    if let Err(err) = state.exporter.export(&mut output) {
        error!("Failed to encode Prometheus metrics: {err}");
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    match String::from_utf8(output) {
        Ok(text) => (StatusCode::OK, text),
        Err(err) => {
            error!("Non UTF-8 Prometheus exporter response: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

fn make_private_router(state: Private) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/metrics", get(metrics))
        .with_state(state)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              serve                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Everything built from one pass over the configuration
struct Running {
    session: Arc<Session>,
    pool: Arc<DbPool>,
    processors: Vec<Processor>,
}

impl Running {
    async fn start(cfg: &ConfigV1, instruments: &Arc<Instruments>) -> Result<Running> {
        let session = Session::open(&cfg.datastore.url, cfg.datastore.max_connections)
            .await
            .context(DatastoreSnafu)?
            .pipe(Arc::new);
        session.migrate().await.context(MigrateSnafu)?;

        let versions = Arc::new(VersionLocks::new(
            session.clone(),
            cfg.versions.clone(),
            instruments.clone(),
        ));
        let tasks = Arc::new(NodeTasks::new(
            session.clone(),
            session.clone(),
            versions.clone(),
            instruments.clone(),
        ));
        let lists = Arc::new(IpLists::new(
            session.clone(),
            versions,
            tasks.clone(),
            cfg.ip_lists.clone(),
            instruments.clone(),
        ));
        let tables = Arc::new(TableManager::new(
            cfg.access_logs.max_rows_per_table,
            instruments.clone(),
        ));
        let pool = Arc::new(DbPool::new(
            session.clone(),
            Arc::new(SqliteConnector::new(cfg.db_pool.max_connections)),
            tables.clone(),
            instruments.clone(),
        ));
        let logs = Arc::new(AccessLogs::new(
            Shard::new(ShardId::Default, session.clone()),
            Some(pool.clone()),
            tables,
            cfg.access_logs.clone(),
            instruments.clone(),
        ));

        let processors = vec![
            periodic::spawn(
                Extractor::new(tasks, cfg.node_tasks.roles.clone()),
                cfg.node_tasks.extract_interval,
                instruments.clone(),
            ),
            periodic::spawn(
                Sweeper::new(lists),
                cfg.ip_lists.sweep_interval,
                instruments.clone(),
            ),
            periodic::spawn(pool.clone(), cfg.db_pool.interval, instruments.clone()),
            periodic::spawn(
                Janitor::new(logs),
                cfg.access_logs.janitor_interval,
                instruments.clone(),
            ),
        ];
        info!("Started {} background jobs against {}", processors.len(), cfg.datastore.url);

        Ok(Running {
            session,
            pool,
            processors,
        })
    }

    /// Stop the jobs & close every connection; failures are logged, since there's nothing else
    /// to be done about them
    async fn stop(self) {
        for processor in self.processors {
            let name = processor.name();
            match processor.shutdown(Duration::from_secs(5)).await {
                Ok(_) => debug!("Job {name} stopped."),
                Err(err) => error!("Failed to stop job {name}: {err}"),
            }
        }
        self.pool.shutdown().await;
        self.session.close().await;
    }
}

#[tracing::instrument(skip_all)]
async fn serve(
    opts: CliOpts,
    mut cfg: ConfigV1,
    log_file_hup: Option<mpsc::Sender<PathBuf>>,
) -> Result<()> {
    async fn shutdown_signal(nfy: Arc<Notify>) {
        nfy.notified().await
    }

    let mut sighup = signal(SignalKind::hangup()).context(SignalSnafu)?;
    let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;
    let mut sigint = signal(SignalKind::interrupt()).context(SignalSnafu)?;

    let exporter = init_telemetry();
    let instruments = Arc::new(Instruments::new("edgeplane"));

    // Loop until asked to terminate, re-building everything on each SIGHUP in case the
    // configuration changed:
    loop {
        let running = Running::start(&cfg, &instruments).await?;

        let private_nfy = Arc::new(Notify::new());
        let addr = cfg.private_address();
        let private_server = axum::serve(
            TcpListener::bind(addr)
                .await
                .context(BindSnafu { addr })?,
            make_private_router(Private {
                exporter: exporter.clone(),
            }),
        )
        .with_graceful_shutdown(shutdown_signal(private_nfy.clone()));
        let private_server = private_server.into_future();
        tokio::pin!(private_server);
        info!("Serving health & metrics on {addr}");

        let terminate = tokio::select! {
            res = &mut private_server => {
                error!("The private server exited unexpectedly ({res:?}); shutting-down.");
                running.stop().await;
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP; re-reading configuration.");
                false
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM; terminating.");
                true
            }
            _ = sigint.recv() => {
                info!("Received SIGINT; terminating.");
                true
            }
        };

        private_nfy.notify_one();
        if let Err(err) = private_server.await {
            error!("{err:?}");
        }
        running.stop().await;

        if terminate {
            break;
        }

        // Fall back to the last known-good configuration on error
        cfg = match parse_config(&opts.cfg) {
            Ok(cfg) => cfg,
            Err(err) => {
                error!("{err}; keeping the current configuration.");
                cfg
            }
        };
        if let Some(ref lfh) = log_file_hup {
            // logrotate & friends rename the file out from under us & then HUP us, so close &
            // re-open under the configured name:
            lfh.send(cfg.log_file()).await.context(LogHupSnafu)?;
            info!("Started new log file.");
        }
    }

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    main() & process startup                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Set up an OTel meter provider exporting to Prometheus' text format; must be called from inside
/// the Tokio runtime, before any instruments are built
fn init_telemetry() -> PrometheusExporter {
    check_metric_registrations();
    let exporter = PrometheusExporter::new();
    let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_resource(
            opentelemetry_sdk::Resource::builder_empty()
                .with_attribute(KeyValue::new("service.name", "edgeplane"))
                .build(),
        )
        .with_reader(exporter.clone())
        .build();
    global::set_meter_provider(provider);
    exporter
}

async fn go_async(
    opts: CliOpts,
    bootstrap_logging_guard: tracing::dispatcher::DefaultGuard,
) -> Result<()> {
    // Configure logging *before* calling `serve()`, since it's instrumented. Failure to parse the
    // configuration here is fatal; once running, we fall back to the last known-good one.
    let cfg = parse_config(&opts.cfg)?;
    let (formatter, filter, log_file_hup) = configure_logging(&opts.log_opts, &cfg.log_file())?;
    tracing::subscriber::set_global_default(Registry::default().with(formatter).with(filter))
        .context(SubscriberSnafu)?;
    drop(bootstrap_logging_guard);

    info!("edgeplane version {} starting.", crate_version!());
    serve(opts, cfg, log_file_hup).await
}

fn main() -> Result<()> {
    let opts = CliOpts::new(
        Command::new("edgeplaned")
            .version(crate_version!())
            .author(crate_authors!())
            .about("CDN control-plane housekeeping")
            .long_about(
                "`edgeplaned` runs the periodic control-plane jobs: node task extraction, IP item \
                 sweeping, log-database reconciliation & log retention.",
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("EDGEPLANE_CONFIG")
                    .help(
                        "path (absolute or relative to the process' current directory) to a \
                         configuration file",
                    ),
            )
            .arg(
                Arg::new("debug")
                    .short('D')
                    .long("debug")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("EDGEPLANE_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("foreground")
                    .short('F')
                    .long("foreground")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("EDGEPLANE_FOREGROUND")
                    .help("log to stdout rather than the configured log file"),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("EDGEPLANE_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("EDGEPLANE_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("EDGEPLANE_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    );

    // Until the configuration's been read, log to stderr.
    let bootstrap_subscriber = Registry::default()
        .with(fmt::Layer::default().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(opts.log_opts.level.into())
                .from_env()
                .context(EnvFilterSnafu)?,
        );
    let bootstrap_logging_guard = tracing::subscriber::set_default(bootstrap_subscriber);
    debug!("Temporarily logging to stderr while initializing.");

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(go_async(opts, bootstrap_logging_guard))
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn config_parses() {
        let text = r#"
version = "1"
log-file = "/var/log/edgeplane.log"
private-address = "127.0.0.1:9000"

[datastore]
url = "sqlite:/tmp/edgeplane.db"
max-connections = 2

[node-tasks]
extract-interval = { secs = 5, nanos = 0 }
roles = ["node"]

[access-logs]
max-rows-per-table = 1000
retention-days = 3
janitor-interval = { secs = 600, nanos = 0 }
"#;
        let Configuration::V1(cfg) = toml::from_str::<Configuration>(text).unwrap();
        assert_eq!(cfg.datastore.max_connections, 2);
        assert_eq!(cfg.node_tasks.roles, vec![Role::Node]);
        assert_eq!(cfg.access_logs.max_rows_per_table, 1000);
        assert_eq!(cfg.private_address().port(), 9000);
        // Unmentioned sections take their defaults
        assert_eq!(cfg.versions.max_attempts, versions::Config::default().max_attempts);
        assert!(parse_config(&Some(PathBuf::from_str("/no/such/edgeplane.toml").unwrap())).is_err());
    }
}
