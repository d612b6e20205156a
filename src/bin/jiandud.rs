// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of jiandu.
//
// jiandu is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// jiandu is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with jiandu.  If not,
// see <http://www.gnu.org/licenses/>.

//! # jiandud
//!
//! The record-management daemon for the municipal supervisory office: JSON-file-backed
//! collections of projects, directives, work logs, statutes and their attachments, served over
//! HTTP. Configuration comes from a versioned TOML file; the handful of command-line options
//! govern where to find it and how to log, each with an environment-variable fallback for
//! container deployments.

use std::{
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use axum::{extract::DefaultBodyLimit, http::HeaderValue, routing::get, Router};
use clap::{crate_authors, crate_version, value_parser, Arg, ArgAction, Command};
use serde::Deserialize;
use snafu::{prelude::*, IntoError};
use tap::Pipe;
use tokio::{net::TcpListener, signal::unix::{signal, SignalKind}};
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};
use tracing_subscriber::{
    filter::EnvFilter, fmt, layer::SubscriberExt, Layer, Registry,
};
use uuid::Uuid;

use jiandu::{
    admins::{self, Admins},
    departments, directives,
    http::Jiandu,
    monthly, progress,
    projects::{self, Projects},
    reports,
    sessions::SessionRegistry,
    statutes, store::Store, topics, weekly,
};

/// The jiandud application error type
///
/// Following the pattern of keeping the application-level error rich for the operator's sake,
/// while each library module keeps its own small error type. `Debug` is hand-implemented so the
/// message the Rust runtime prints on a non-zero exit is the `Display` form, not the derived
/// tree.
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind to {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Unable to read configuration file: {source}"))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Error parsing configuration file: {source}"))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to open the jiandud log file: {source}"))]
    LogFile { source: std::io::Error },
    #[snafu(display("While serving requests: {source}"))]
    Serve { source: std::io::Error },
    #[snafu(display("Failed to prime the document store: {source}"))]
    Store { source: jiandu::store::Error },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

const UPLOAD_LIMIT: usize = 50 * 1024 * 1024;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Logging-related options read from the command line or the environment
struct LogOpts {
    pub plain: bool,
    pub level: Level,
}

impl LogOpts {
    fn new(matches: &clap::ArgMatches) -> LogOpts {
        LogOpts {
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
    pub instance_id: Uuid,
    pub log_opts: LogOpts,
    pub cfg: Option<PathBuf>,
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> CliOpts {
        CliOpts {
            instance_id: matches
                .get_one::<Uuid>("instance-id")
                .cloned()
                .unwrap_or(Uuid::new_v4()),
            log_opts: LogOpts::new(&matches),
            cfg: matches.get_one::<PathBuf>("config").cloned(),
            port: matches.get_one::<u16>("port").cloned(),
            data_dir: matches.get_one::<PathBuf>("data-dir").cloned(),
        }
    }
}

/// jiandud configuration, version one
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
struct ConfigV1 {
    /// The jiandud log file; stdout when absent
    #[serde(rename = "log-file")]
    log_file: Option<PathBuf>,
    /// Local address at which to listen; specify as "address:port"
    address: SocketAddr,
    /// Database name; selects the directory under `data-dir` holding the JSON documents
    #[serde(rename = "database-name")]
    database_name: String,
    /// Directory holding the databases (and any legacy flat-layout files to migrate)
    #[serde(rename = "data-dir")]
    data_dir: PathBuf,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            log_file: None,
            address: "0.0.0.0:3000".parse::<SocketAddr>().unwrap(/* known good */),
            database_name: "jiandu".to_owned(),
            data_dir: PathBuf::from_str("data").unwrap(/* known good */),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the jiandud configuration file. A missing file is only an error when the operator
/// asked for it by path; the default location falls back to default configuration.
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from_str("/etc/jiandud.toml").unwrap(), true),
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

/// Configure jiandud logging: JSON to stdout by default, human-readable with `--plain`, to file
/// when the configuration names one. Can only be invoked once (it installs the global tracing
/// subscriber).
fn configure_logging(logopts: &LogOpts, logfile: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(logopts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    // `json()` & `compact()` produce formatters *of different types*, which is why the boxed
    // `Layer` dance below.
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = match logfile {
        Some(pth) => {
            let fd = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(pth)
                .map(Mutex::new)
                .context(LogFileSnafu)?;
            if logopts.plain {
                Box::new(fmt::Layer::default().compact().with_ansi(false).with_writer(fd))
            } else {
                Box::new(fmt::Layer::default().json().with_current_span(true).with_writer(fd))
            }
        }
        None => {
            if logopts.plain {
                Box::new(fmt::Layer::default().compact().with_writer(io::stdout))
            } else {
                Box::new(
                    fmt::Layer::default()
                        .json()
                        .with_current_span(true)
                        .with_writer(io::stdout),
                )
            }
        }
    };

    tracing::subscriber::set_global_default(Registry::default().with(formatter).with(filter))
        .context(SubscriberSnafu)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the server                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Counter for generating request IDs; a u64 carries less information than the traditional
/// UUID, but it's more readable in the logs and doubles as a rough uptime gauge.
#[derive(Clone, Debug, Default)]
struct RequestIdGenerator {
    counter: Arc<AtomicU64>,
}

impl MakeRequestId for RequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &axum::extract::Request<B>) -> Option<RequestId> {
        self.counter
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
            .pipe(|s| RequestId::new(HeaderValue::from_str(&s).unwrap(/* known good */)))
            .pipe(Some)
    }
}

async fn healthcheck() -> &'static str {
    "GOOD"
}

/// Assemble the application router: every module contributes its own, merged here, wrapped in
/// the request-id/trace/CORS layers. Incoming requests must hit `SetRequestIdLayer` first, so
/// it's the outermost layer.
fn make_router(state: Arc<Jiandu>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .merge(admins::make_router(state.clone()))
        .merge(projects::make_router(state.clone()))
        .merge(departments::make_router(state.clone()))
        .merge(directives::make_router(state.clone()))
        .merge(monthly::make_router(state.clone()))
        .merge(weekly::make_router(state.clone()))
        .merge(statutes::make_router(state.clone()))
        .merge(progress::make_router(state.clone()))
        .merge(reports::make_router(state.clone()))
        .merge(topics::make_router(state.clone()))
        .layer(DefaultBodyLimit::max(UPLOAD_LIMIT))
        .layer(PropagateRequestIdLayer::new(axum::http::HeaderName::from_static(
            "x-request-id",
        )))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new())
                .on_response(DefaultOnResponse::new()),
        )
        .layer(CorsLayer::permissive())
        .layer(SetRequestIdLayer::new(
            axum::http::HeaderName::from_static("x-request-id"),
            RequestIdGenerator::default(),
        ))
        .with_state(state)
}

/// Serve jiandud API requests until SIGINT/SIGTERM.
#[tracing::instrument(skip(opts, cfg), fields(instance_id = %opts.instance_id))]
async fn serve(opts: CliOpts, cfg: ConfigV1) -> Result<()> {
    let store = Store::new(&cfg.data_dir, &cfg.database_name);
    // One-time migration from the historical layouts, then prime the two seeded collections so
    // first requests find them in place (and the operator sees the bootstrap in the log).
    store.migrate_legacy(&cfg.data_dir).context(StoreSnafu)?;
    store.load::<Projects>().context(StoreSnafu)?;
    store.load::<Admins>().context(StoreSnafu)?;

    let mut address = cfg.address;
    if let Some(port) = opts.port {
        address.set_port(port);
    }

    let state = Arc::new(Jiandu {
        store,
        sessions: SessionRegistry::new(),
        instance_id: opts.instance_id,
    });

    info!("市人大常委会监督协调处管理系统 [{}]", cfg.database_name);
    info!(
        "jiandud {} serving database {} from {} at http://{}",
        crate_version!(),
        cfg.database_name,
        cfg.data_dir.display(),
        address
    );

    let listener = TcpListener::bind(&address)
        .await
        .context(BindSnafu { addr: address })?;

    async fn shutdown_signal() {
        let mut sigterm = signal(SignalKind::terminate()).expect("signal handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
        info!("Shutdown signal received; draining connections.");
    }

    axum::serve(listener, make_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context(ServeSnafu)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    main() & process startup                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn main() -> Result<()> {
    let opts = CliOpts::new(
        Command::new("jiandud")
            .version(crate_version!())
            .author(crate_authors!())
            .about("Record management for the municipal supervisory office")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("JIANDUD_CONFIG")
                    .help(
                        "path (absolute or relative to the process' current directory) to a \
                       configuration file",
                    ),
            )
            .arg(
                Arg::new("data-dir")
                    .short('d')
                    .long("data-dir")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("JIANDUD_DATA_DIR")
                    .help("override the configured data directory"),
            )
            .arg(
                Arg::new("port")
                    .short('p')
                    .long("port")
                    .num_args(1)
                    .value_parser(value_parser!(u16))
                    .env("JIANDUD_PORT")
                    .help("override the configured listening port"),
            )
            .arg(
                Arg::new("debug")
                    .short('D')
                    .long("debug")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("JIANDUD_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("instance-id")
                    .short('I')
                    .long("instance-id")
                    .num_args(1)
                    .value_parser(value_parser!(Uuid))
                    .env("JIANDUD_INSTANCE_ID")
                    .help("instance ID stamped on this process' log spans"),
            )
            .arg(
                Arg::new("plain")
                    .short('P')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("JIANDUD_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("JIANDUD_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("JIANDUD_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    );

    let mut cfg = parse_config(&opts.cfg)?;
    if let Some(data_dir) = &opts.data_dir {
        cfg.data_dir = data_dir.clone();
    }
    configure_logging(&opts.log_opts, cfg.log_file.as_deref())?;

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(serve(opts, cfg))
}
