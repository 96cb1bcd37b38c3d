mod backend;
mod config;
mod connection;
mod filter;
mod model;
mod path;
mod resolve;
mod sync;

use clap::{Args, Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::backend::{Backend, RestBackend};
use crate::config::Config;
use crate::connection::{
    ConnectError, ConnectionManager, Handler, InboundMessage, OutboundMessage, WsConnector,
};
use crate::filter::{Filter, LastUpdated, SortBy, SortDirection};
use crate::path::PathPoint;
use crate::sync::{MapRenderer, Marker, Selection, SyncScheduler, SyncSettings};

#[derive(Parser)]
#[command(name = "track-o-mat")]
#[command(about = "Live tracking sync engine")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep the tracked objects in sync and log every rendered frame
    Watch {
        /// Follow this object id
        #[arg(long)]
        follow: Option<String>,
        /// Hide markers of this type (repeatable)
        #[arg(long = "hide-type")]
        hide_types: Vec<String>,
        /// Open the details view for this object id
        #[arg(long)]
        details: Option<String>,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Fetch once and print the filtered object list
    Objects {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Print the sampled path of one object
    Path {
        id: String,
        /// History window in minutes
        #[arg(long)]
        window: Option<u32>,
    },
    /// Log messages from the object feed
    Listen {
        /// Listen to a data source instead of the object feed
        #[arg(long)]
        source: Option<String>,
    },
    /// Print the effective configuration
    CheckConfig,
}

#[derive(Args)]
struct FilterArgs {
    #[arg(long = "type")]
    kind: Option<String>,
    #[arg(long)]
    source: Option<String>,
    /// Case-insensitive name search
    #[arg(long)]
    name: Option<String>,
    #[arg(long, value_enum)]
    last_updated: Option<LastUpdated>,
    #[arg(long, value_enum)]
    sort_by: Option<SortBy>,
    /// Sort descending (ascending otherwise when a sort key is given)
    #[arg(long)]
    desc: bool,
}

impl FilterArgs {
    /// Flags win over the configured filter.
    fn apply(self, mut filter: Filter) -> Filter {
        if self.kind.is_some() {
            filter.kind = self.kind;
        }
        if self.source.is_some() {
            filter.source_id = self.source;
        }
        if self.name.is_some() {
            filter.name = self.name;
        }
        if let Some(last_updated) = self.last_updated {
            filter.last_updated = last_updated;
        }
        if let Some(sort_by) = self.sort_by {
            filter.sort_by = sort_by;
            filter.sort_direction = if self.desc {
                SortDirection::Desc
            } else {
                SortDirection::Asc
            };
        } else if self.desc {
            filter.sort_direction = SortDirection::Desc;
        }
        filter
    }
}

/// Writes each frame to the log.
struct LogRenderer;

impl MapRenderer for LogRenderer {
    fn render(&mut self, markers: &[Marker], path: &[PathPoint]) {
        log::info!("{} markers, path of {} points", markers.len(), path.len());
        for marker in markers {
            log::info!(
                "  {}{} [{}] {:.5}, {:.5}",
                if marker.selected { "* " } else { "" },
                marker.id,
                marker.icon,
                marker.latitude,
                marker.longitude
            );
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error starting runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let code = runtime.block_on(run(cli));
    // the stdin reader of `watch` may still be parked in a blocking read
    runtime.shutdown_background();
    code
}

async fn run(cli: Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Watch {
            follow,
            hide_types,
            details,
            filter,
        } => {
            let view = ViewOptions {
                follow,
                hide_types,
                details,
            };
            watch(&config, view, filter).await
        }
        Commands::Objects { filter } => objects(&config, filter).await,
        Commands::Path { id, window } => print_path(&config, &id, window).await,
        Commands::Listen { source } => listen(&config, source).await,
        Commands::CheckConfig => check_config(&config),
    }
}

fn settings(config: &Config) -> SyncSettings {
    SyncSettings {
        tick: config.sync.tick,
        path_window_minutes: config.sync.path_window_minutes,
    }
}

/// Initial view state for `watch`.
struct ViewOptions {
    follow: Option<String>,
    hide_types: Vec<String>,
    details: Option<String>,
}

/// Commands read from stdin while `watch` runs.
#[derive(Debug, PartialEq, Eq)]
enum ViewCommand {
    Follow(String),
    ToggleType(String),
    Details(String),
    Close,
    Search(Option<String>),
    Refresh,
}

impl ViewCommand {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (verb, arg) = match line.split_once(char::is_whitespace) {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (line, ""),
        };
        let arg = (!arg.is_empty()).then(|| arg.to_string());
        match (verb, arg) {
            ("follow", Some(id)) => Some(ViewCommand::Follow(id)),
            ("toggle", Some(kind)) => Some(ViewCommand::ToggleType(kind)),
            ("details", Some(id)) => Some(ViewCommand::Details(id)),
            ("close", None) => Some(ViewCommand::Close),
            ("search", name) => Some(ViewCommand::Search(name)),
            ("refresh", None) => Some(ViewCommand::Refresh),
            _ => None,
        }
    }

    fn apply<B: Backend>(self, sync: &SyncScheduler<B>) {
        match self {
            ViewCommand::Follow(id) => match sync.toggle_follow(&id) {
                Selection::Followed(id) => log::info!("Following {}", id),
                Selection::Cleared => log::info!("Stopped following"),
                Selection::Unknown => log::warn!("Object {} is not in the current list", id),
            },
            ViewCommand::ToggleType(kind) => {
                sync.toggle_type(&kind);
                let hidden = sync.snapshot().is_hidden(&kind);
                log::info!("Type {} is {}", kind, if hidden { "hidden" } else { "shown" });
            }
            ViewCommand::Details(id) => {
                sync.open_details(&id);
                match &sync.snapshot().details {
                    Some(entry) => log::info!(
                        "{} ({}) from {}, updated {}",
                        entry.object.display_name(),
                        entry.object.kind,
                        entry.object.source_id,
                        entry.object.updated_at
                    ),
                    None => log::warn!("Object {} is not in the current list", id),
                }
            }
            ViewCommand::Close => sync.close_details(),
            ViewCommand::Search(name) => {
                let filter = Filter {
                    name,
                    ..(*sync.snapshot().filter).clone()
                };
                sync.set_filter(filter);
            }
            ViewCommand::Refresh => sync.wake(),
        }
    }
}

async fn watch(config: &Config, view: ViewOptions, args: FilterArgs) -> ExitCode {
    let backend = RestBackend::new(&config.backend.api_url);
    let filter = args.apply(config.sync.filter.clone());
    let mut sync = SyncScheduler::new(backend, settings(config), filter);

    if let Err(e) = sync.load_types().await {
        log::warn!("Failed to load object types, using built-in icons: {}", e);
    }
    if let Err(e) = sync.tick().await {
        eprintln!("Initial refresh failed: {}", e);
        return ExitCode::FAILURE;
    }
    for kind in view.hide_types {
        ViewCommand::ToggleType(kind).apply(&sync);
    }
    if let Some(id) = view.details {
        ViewCommand::Details(id).apply(&sync);
    }
    if let Some(id) = view.follow {
        ViewCommand::Follow(id).apply(&sync);
    }

    let feed = ConnectionManager::new(
        connection::objects_endpoint(&config.backend.ws_url, &config.backend.client_id),
        WsConnector,
        config.connection.policy(),
    );
    sync.attach_feed(&feed);
    if let Err(e) = feed.connect().await {
        log::warn!("Object feed unavailable, polling only: {}", e);
    }

    let mut frames = sync.subscribe();
    if let Err(e) = sync.start() {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    let mut renderer = LogRenderer;
    let mut feed_state = feed.watch_state();
    let mut commands = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            changed = frames.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = frames.borrow_and_update().clone();
                if let Some(error) = &snapshot.last_error {
                    log::warn!("Last refresh failed: {}", error);
                }
                snapshot.render_to(&mut renderer);
            }
            changed = feed_state.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *feed_state.borrow_and_update();
                log::info!("Object feed is {}", state);
            }
            line = commands.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match ViewCommand::parse(&line) {
                    Some(command) => command.apply(&sync),
                    None => log::warn!(
                        "Unknown command {:?} (follow ID, toggle TYPE, details ID, close, search [NAME], refresh)",
                        line
                    ),
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    log::warn!("Failed to read commands: {}", e);
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted");
                break;
            }
        }
    }

    sync.stop().await;
    feed.disconnect();
    ExitCode::SUCCESS
}

async fn objects(config: &Config, args: FilterArgs) -> ExitCode {
    let backend = RestBackend::new(&config.backend.api_url);
    let filter = args.apply(config.sync.filter.clone());
    let sync = SyncScheduler::new(backend, settings(config), filter);

    if let Err(e) = sync.tick().await {
        eprintln!("Error fetching objects: {}", e);
        return ExitCode::FAILURE;
    }

    let snapshot = sync.snapshot();
    println!("{} objects", snapshot.view.len());
    for entry in snapshot.view.iter() {
        let position = match &entry.position {
            Some(p) => format!("{:.5}, {:.5} @ {}", p.latitude, p.longitude, p.timestamp),
            None => "no position".to_string(),
        };
        println!(
            "  {} {} ({}) updated {} - {}",
            entry.object.id,
            entry.object.display_name(),
            entry.object.kind,
            entry.object.updated_at,
            position
        );
    }
    for (kind, count) in filter::type_counts(&snapshot.objects) {
        println!("  {}: {}", kind, count);
    }
    ExitCode::SUCCESS
}

async fn print_path(config: &Config, id: &str, window: Option<u32>) -> ExitCode {
    let backend = RestBackend::new(&config.backend.api_url);
    let window = window.unwrap_or(config.sync.path_window_minutes);

    let object = match backend.get_object(id).await {
        Ok(o) => o,
        Err(e) if e.is_not_found() => {
            eprintln!("No object with id {}", id);
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("Error fetching object: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match path::fetch_path(&backend, id, window).await {
        Ok(points) => {
            println!(
                "{}: {} points over the last {} minutes",
                object.display_name(),
                points.len(),
                window
            );
            for point in points {
                println!("  {} {:.5}, {:.5}", point.timestamp, point.latitude, point.longitude);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error fetching path: {}", e);
            ExitCode::FAILURE
        }
    }
}

const FEED_KINDS: [&str; 5] = ["object_update", "ack", "subscribe_ack", "objects_data", "error"];

async fn listen(config: &Config, source: Option<String>) -> ExitCode {
    let url = match &source {
        Some(source) => connection::data_source_endpoint(
            &config.backend.ws_url,
            source,
            &config.backend.client_id,
        ),
        None => connection::objects_endpoint(&config.backend.ws_url, &config.backend.client_id),
    };
    let feed = ConnectionManager::new(url, WsConnector, config.connection.policy());

    let log_message: Handler = Arc::new(|message: &InboundMessage| match message {
        InboundMessage::Error { message } => log::warn!("Feed error: {}", message),
        other => log::info!("{}: {:?}", other.kind(), other),
    });
    for kind in FEED_KINDS {
        feed.subscribe(kind, log_message.clone());
    }

    log::info!("Connecting to {}", feed.url());
    match feed.connect().await {
        Ok(()) => request_objects(&feed, config, source.is_none()),
        Err(ConnectError::Handshake(reason)) => {
            log::warn!("Handshake failed, retrying in the background: {}", reason);
        }
        Err(e) => {
            eprintln!("Connection failed: {}", e);
            return ExitCode::FAILURE;
        }
    }

    let mut state = feed.watch_state();
    let code = loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break ExitCode::FAILURE;
                }
                let current = *state.borrow_and_update();
                log::info!("Feed is {}", current);
                if current == connection::ConnectionState::Failed {
                    eprintln!("Giving up after {} reconnect attempts", feed.attempts());
                    break ExitCode::FAILURE;
                }
            }
            _ = tokio::signal::ctrl_c() => break ExitCode::SUCCESS,
        }
    };

    for kind in FEED_KINDS {
        feed.unsubscribe(kind, &log_message);
    }
    feed.disconnect();
    code
}

/// Asks the object feed for the current set, narrowed to the configured type.
fn request_objects(feed: &ConnectionManager, config: &Config, object_feed: bool) {
    if !object_feed {
        return;
    }
    let requests = match &config.sync.filter.kind {
        Some(kind) => vec![
            OutboundMessage::Subscribe {
                object_types: vec![kind.clone()],
            },
            OutboundMessage::GetObjects {
                object_type: Some(kind.clone()),
                limit: 100,
            },
        ],
        None => vec![OutboundMessage::GetObjects {
            object_type: None,
            limit: 100,
        }],
    };
    for request in requests {
        if let Err(e) = feed.send(&request) {
            log::warn!("Failed to send {:?}: {}", request, e);
        }
    }
}

fn check_config(config: &Config) -> ExitCode {
    match serde_yaml::to_string(config) {
        Ok(yaml) => {
            println!("{}", yaml);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error serializing config: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_command_parse() {
        assert_eq!(
            ViewCommand::parse("follow  b-12 "),
            Some(ViewCommand::Follow("b-12".to_string()))
        );
        assert_eq!(
            ViewCommand::parse("toggle drone"),
            Some(ViewCommand::ToggleType("drone".to_string()))
        );
        assert_eq!(
            ViewCommand::parse("details c"),
            Some(ViewCommand::Details("c".to_string()))
        );
        assert_eq!(ViewCommand::parse("close"), Some(ViewCommand::Close));
        assert_eq!(
            ViewCommand::parse("search north sea"),
            Some(ViewCommand::Search(Some("north sea".to_string())))
        );
        assert_eq!(ViewCommand::parse("search"), Some(ViewCommand::Search(None)));
        assert_eq!(ViewCommand::parse("refresh"), Some(ViewCommand::Refresh));
        assert_eq!(ViewCommand::parse("follow"), None);
        assert_eq!(ViewCommand::parse("close now"), None);
        assert_eq!(ViewCommand::parse("zoom 3"), None);
    }

    #[test]
    fn test_filter_flags_override_config() {
        let args = FilterArgs {
            kind: Some("ship".to_string()),
            source: None,
            name: None,
            last_updated: Some(LastUpdated::Week),
            sort_by: Some(SortBy::Name),
            desc: false,
        };
        let configured = Filter {
            source_id: Some("src-1".to_string()),
            ..Filter::default()
        };
        let filter = args.apply(configured);
        assert_eq!(filter.kind.as_deref(), Some("ship"));
        assert_eq!(filter.source_id.as_deref(), Some("src-1"));
        assert_eq!(filter.last_updated, LastUpdated::Week);
        assert_eq!(filter.sort_by, SortBy::Name);
        assert_eq!(filter.sort_direction, SortDirection::Asc);
    }
}
