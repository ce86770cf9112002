use std::{
    collections::{BTreeMap, BTreeSet},
    env,
    io,
    net::{SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::strobe_core::{Command, CommandStore, Event, EventBus, FilterState};
use crate::strobe_export::{
    default_export_dir, now_epoch_millis, ChannelChooser, ChannelNotices, DestinationRequest,
    ExportJob, ExportKind, ExportOutcome, Exporter, LogNotices, Notice, PresetDestination,
    TokioFileWriter,
};
use crate::strobe_ingest::{now_utc, router, Ingestor};
use crate::strobe_timeline::Timeline;
use crate::strobe_tui::{Action, Tui};
use clap::{Args, Parser, Subcommand};
use crossterm::{
    event::{self, Event as TermEvent, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 9090;
const DEFAULT_TUI_ENABLED: bool = true;
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
const DEFAULT_SEARCH_DEBOUNCE_MS: u64 = 300;
const TUI_TICK_MS: u64 = 50;
const CONFIG_FILE_NAME: &str = "strobe.json";

pub type DynError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug)]
enum UiEvent {
    Command(crate::strobe_core::IncomingCommand),
    Clear,
    Quit,
}

#[derive(Parser, Debug)]
#[command(name = "strobe", version, about = "Strobe command timeline inspector")]
struct Cli {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, action = clap::ArgAction::SetTrue)]
    tui: bool,
    #[arg(long, action = clap::ArgAction::SetTrue)]
    no_tui: bool,
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Write an export from a saved raw timeline log.
    Export(ExportArgs),
}

#[derive(Args, Debug)]
struct ExportArgs {
    /// Raw timeline log (JSON array of commands).
    #[arg(long)]
    input: PathBuf,
    /// Write the API-call report instead of the raw log.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    api: bool,
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct Config {
    enabled: bool,
    host: String,
    port: u16,
    tui_enabled: bool,
    max_body_bytes: usize,
    search_debounce_ms: u64,
    export_dir: Option<PathBuf>,
    hidden_types: BTreeSet<String>,
    allow_remote: bool,
}

#[derive(Debug, Default, Clone)]
struct PartialConfig {
    enabled: Option<bool>,
    host: Option<String>,
    port: Option<u16>,
    tui_enabled: Option<bool>,
    max_body_bytes: Option<usize>,
    search_debounce_ms: Option<u64>,
    export_dir: Option<PathBuf>,
    hidden_types: Option<BTreeSet<String>>,
    allow_remote: Option<bool>,
}

impl PartialConfig {
    fn merge(&mut self, other: PartialConfig) {
        if other.enabled.is_some() {
            self.enabled = other.enabled;
        }
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.tui_enabled.is_some() {
            self.tui_enabled = other.tui_enabled;
        }
        if other.max_body_bytes.is_some() {
            self.max_body_bytes = other.max_body_bytes;
        }
        if other.search_debounce_ms.is_some() {
            self.search_debounce_ms = other.search_debounce_ms;
        }
        if other.export_dir.is_some() {
            self.export_dir = other.export_dir;
        }
        if other.hidden_types.is_some() {
            self.hidden_types = other.hidden_types;
        }
        if other.allow_remote.is_some() {
            self.allow_remote = other.allow_remote;
        }
    }
}

impl Config {
    fn from_partial(partial: PartialConfig) -> Self {
        Self {
            enabled: partial.enabled.unwrap_or(true),
            host: partial.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: partial.port.unwrap_or(DEFAULT_PORT),
            tui_enabled: partial.tui_enabled.unwrap_or(DEFAULT_TUI_ENABLED),
            max_body_bytes: partial.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES),
            search_debounce_ms: partial.search_debounce_ms.unwrap_or(DEFAULT_SEARCH_DEBOUNCE_MS),
            export_dir: partial.export_dir,
            hidden_types: partial.hidden_types.unwrap_or_default(),
            allow_remote: partial.allow_remote.unwrap_or(false),
        }
    }

    fn build_timeline(&self) -> Timeline {
        let mut timeline =
            Timeline::default().with_filters(FilterState::new("", self.hidden_types.clone()));
        timeline.set_debounce(Duration::from_millis(self.search_debounce_ms));
        timeline
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    enabled: Option<bool>,
    host: Option<String>,
    port: Option<u16>,
    tui: Option<bool>,
    #[serde(alias = "noTui", alias = "no-tui")]
    no_tui: Option<bool>,
    max_body_bytes: Option<usize>,
    search_debounce_ms: Option<u64>,
    export_dir: Option<PathBuf>,
    hidden_types: Option<Vec<String>>,
    allow_remote: Option<bool>,
}

impl FileConfig {
    fn into_partial(self) -> PartialConfig {
        let tui_enabled = match (self.tui, self.no_tui) {
            (_, Some(no_tui)) => Some(!no_tui),
            (Some(tui), None) => Some(tui),
            (None, None) => None,
        };

        PartialConfig {
            enabled: self.enabled,
            host: self.host,
            port: self.port,
            tui_enabled,
            max_body_bytes: self.max_body_bytes,
            search_debounce_ms: self.search_debounce_ms,
            export_dir: self.export_dir,
            hidden_types: self.hidden_types.map(|types| types.into_iter().collect()),
            allow_remote: self.allow_remote,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    ParseFile { path: PathBuf, source: serde_json::Error },
    #[error("config file not found: {path}")]
    MissingConfig { path: PathBuf },
    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },
}

/// Single-consumer bus feeding the timeline owner. Events queue until the owner
/// subscribes and are never dropped while it is alive.
#[derive(Clone)]
struct StrobeBus {
    sender: mpsc::UnboundedSender<Event>,
    receiver: Arc<Mutex<Option<mpsc::UnboundedReceiver<Event>>>>,
}

impl StrobeBus {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self { sender, receiver: Arc::new(Mutex::new(Some(receiver))) }
    }
}

impl EventBus for StrobeBus {
    type Error = String;
    type Subscription = mpsc::UnboundedReceiver<Event>;

    fn emit(&self, event: Event) -> Result<(), Self::Error> {
        self.sender.send(event).map_err(|_| "timeline owner stopped".to_string())
    }

    fn subscribe(&self) -> Result<Self::Subscription, Self::Error> {
        let mut slot = self.receiver.lock().map_err(|_| "event bus lock poisoned".to_string())?;
        slot.take().ok_or_else(|| "event bus already has a consumer".to_string())
    }
}

fn cli_overrides(cli: &Cli) -> PartialConfig {
    let tui_enabled = if cli.no_tui {
        Some(false)
    } else if cli.tui {
        Some(true)
    } else {
        None
    };
    PartialConfig { host: cli.host.clone(), port: cli.port, tui_enabled, ..PartialConfig::default() }
}

fn env_overrides(env: &BTreeMap<String, String>) -> Result<PartialConfig, ConfigError> {
    let mut partial = PartialConfig::default();
    if let Some(enabled) = env.get("STROBE_ENABLED") {
        partial.enabled = Some(parse_bool("STROBE_ENABLED", enabled)?);
    }
    if let Some(host) = env.get("STROBE_HOST") {
        partial.host = Some(host.clone());
    }
    if let Some(port) = env.get("STROBE_PORT") {
        partial.port = Some(parse_u16("STROBE_PORT", port)?);
    }
    if let Some(value) = env.get("STROBE_MAX_BODY_BYTES") {
        partial.max_body_bytes = Some(parse_usize("STROBE_MAX_BODY_BYTES", value)?);
    }
    if let Some(value) = env.get("STROBE_SEARCH_DEBOUNCE_MS") {
        partial.search_debounce_ms = Some(parse_u64("STROBE_SEARCH_DEBOUNCE_MS", value)?);
    }
    if let Some(value) = env.get("STROBE_EXPORT_DIR") {
        if !value.trim().is_empty() {
            partial.export_dir = Some(PathBuf::from(value));
        }
    }
    if let Some(value) = env.get("STROBE_HIDDEN_TYPES") {
        partial.hidden_types = Some(parse_list(value));
    }
    if let Some(value) = env.get("STROBE_ALLOW_REMOTE") {
        partial.allow_remote = Some(parse_bool("STROBE_ALLOW_REMOTE", value)?);
    }
    if let Some(no_tui) = env.get("STROBE_NO_TUI") {
        let disabled = parse_bool("STROBE_NO_TUI", no_tui)?;
        partial.tui_enabled = Some(!disabled);
    }
    if partial.tui_enabled.is_none() {
        if let Some(tui) = env.get("STROBE_TUI") {
            partial.tui_enabled = Some(parse_bool("STROBE_TUI", tui)?);
        }
    }
    Ok(partial)
}

fn parse_list(value: &str) -> BTreeSet<String> {
    value.split(',').map(str::trim).filter(|item| !item.is_empty()).map(str::to_string).collect()
}

fn parse_u16(name: &str, value: &str) -> Result<u16, ConfigError> {
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidEnv { name: name.to_string(), value: value.to_string() })
}

fn parse_usize(name: &str, value: &str) -> Result<usize, ConfigError> {
    value
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidEnv { name: name.to_string(), value: value.to_string() })
}

fn parse_u64(name: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidEnv { name: name.to_string(), value: value.to_string() })
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv { name: name.to_string(), value: value.to_string() }),
    }
}

fn load_config_file(path: &Path) -> Result<PartialConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    let parsed: FileConfig = serde_json::from_str(&contents)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })?;
    Ok(parsed.into_partial())
}

fn find_config_path(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        let candidate = current.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !current.pop() {
            break;
        }
    }
    None
}

fn resolve_config(
    cli: &Cli,
    cwd: &Path,
    env: &BTreeMap<String, String>,
) -> Result<(Config, Option<PathBuf>), ConfigError> {
    let mut partial = PartialConfig::default();

    let config_path = if let Some(path) = &cli.config {
        if !path.is_file() {
            return Err(ConfigError::MissingConfig { path: path.clone() });
        }
        Some(path.clone())
    } else {
        find_config_path(cwd)
    };

    if let Some(path) = config_path.as_ref() {
        partial.merge(load_config_file(path)?);
    }
    partial.merge(env_overrides(env)?);
    partial.merge(cli_overrides(cli));

    Ok((Config::from_partial(partial), config_path))
}

fn resolve_bind_addr(host: &str, port: u16, allow_remote: bool) -> Result<SocketAddr, DynError> {
    let mut addrs = (host, port).to_socket_addrs()?;
    let addr = addrs.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "no bind addresses resolved")
    })?;
    if !allow_remote && !addr.ip().is_loopback() {
        return Err(format!(
            "refusing to bind to non-loopback address {addr}. Set STROBE_ALLOW_REMOTE=1 if you really want remote access."
        )
        .into());
    }
    Ok(addr)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

async fn run_server(
    config: Config,
    bus: StrobeBus,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), DynError> {
    let addr = resolve_bind_addr(&config.host, config.port, config.allow_remote)?;
    let app = router(Arc::new(Ingestor::new(bus, now_utc)), config.max_body_bytes);
    info!(%addr, "starting http server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

fn apply_event(timeline: &mut Timeline, event: Event) {
    match event {
        Event::CommandReceived(command) => {
            let command_type = command.r#type.clone();
            let message_id = timeline.append(command);
            debug!(message_id, command_type = %command_type, "command appended");
        }
        Event::TimelineCleared => {
            timeline.clear();
            info!("timeline cleared");
        }
    }
}

/// Owns the timeline when no terminal UI is attached.
async fn run_headless(
    mut timeline: Timeline,
    bus: StrobeBus,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), DynError> {
    let mut events = bus.subscribe()?;
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            event = events.recv() => match event {
                Some(event) => apply_event(&mut timeline, event),
                None => break,
            },
        }
    }
    info!(commands = timeline.commands().len(), "headless consumer stopped");
    Ok(())
}

async fn run_export_worker<D, W, N, C>(exporter: Exporter<D, W, N, C>, mut jobs: mpsc::UnboundedReceiver<ExportJob>)
where
    D: crate::strobe_export::DestinationChooser,
    W: crate::strobe_export::FileWriter,
    N: crate::strobe_export::NoticePresenter,
    C: Fn() -> i64 + Send + Sync,
{
    while let Some(job) = jobs.recv().await {
        let kind = job.kind;
        match exporter.run(job).await {
            Ok(outcome) => debug!(?kind, ?outcome, "export finished"),
            Err(error) => debug!(?kind, error = %error, "export failed"),
        }
    }
}

async fn run_tui(
    timeline: Timeline,
    export_dir: PathBuf,
    bus: StrobeBus,
    mut shutdown: broadcast::Receiver<()>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DynError> {
    let mut event_rx = bus.subscribe()?;
    let (ui_tx, ui_rx) = std::sync::mpsc::channel::<UiEvent>();
    let ui_tx_shutdown = ui_tx.clone();
    let running = Arc::new(AtomicBool::new(true));
    let running_signal = running.clone();

    let (prompt_tx, prompt_rx) = mpsc::unbounded_channel::<DestinationRequest>();
    let (notice_tx, notice_rx) = mpsc::unbounded_channel::<Notice>();
    let (export_tx, export_rx) = mpsc::unbounded_channel::<ExportJob>();
    let exporter = Exporter::new(
        ChannelChooser::new(prompt_tx),
        TokioFileWriter,
        ChannelNotices::new(notice_tx),
        export_dir,
        now_epoch_millis,
    );
    let export_handle = tokio::spawn(run_export_worker(exporter, export_rx));

    let forward_handle = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let ui_event = match event {
                Event::CommandReceived(command) => UiEvent::Command(command),
                Event::TimelineCleared => UiEvent::Clear,
            };
            if ui_tx.send(ui_event).is_err() {
                break;
            }
        }
    });

    let shutdown_handle = tokio::spawn(async move {
        let _ = shutdown.recv().await;
        let _ = ui_tx_shutdown.send(UiEvent::Quit);
        running_signal.store(false, Ordering::SeqCst);
    });

    let channels = TuiChannels { ui_rx, prompt_rx, notice_rx, export_tx };
    let ui_handle = tokio::task::spawn_blocking(move || run_tui_loop(timeline, channels, running, shutdown_tx));
    finish_ui(ui_handle, &[forward_handle, shutdown_handle, export_handle]).await
}

/// Waits for the UI loop, then stops its helper tasks whether the loop failed or not.
async fn finish_ui(ui_handle: JoinHandle<Result<(), DynError>>, helpers: &[JoinHandle<()>]) -> Result<(), DynError> {
    let result = ui_handle.await;
    for helper in helpers {
        helper.abort();
    }
    result?
}

struct TuiChannels {
    ui_rx: std::sync::mpsc::Receiver<UiEvent>,
    prompt_rx: mpsc::UnboundedReceiver<DestinationRequest>,
    notice_rx: mpsc::UnboundedReceiver<Notice>,
    export_tx: mpsc::UnboundedSender<ExportJob>,
}

fn run_tui_loop(
    timeline: Timeline,
    mut channels: TuiChannels,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DynError> {
    let _guard = TerminalGuard::enter()?;
    let backend = CrosstermBackend::new(io::stdout());
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;
    terminal.hide_cursor()?;

    let mut tui = Tui::new(timeline).with_exports(channels.export_tx.clone());

    while running.load(Ordering::SeqCst) {
        while let Ok(event) = channels.ui_rx.try_recv() {
            match event {
                UiEvent::Command(command) => tui.push_command(command),
                UiEvent::Clear => tui.clear_timeline(),
                UiEvent::Quit => {
                    running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }

        if !running.load(Ordering::SeqCst) {
            break;
        }

        while let Ok(request) = channels.prompt_rx.try_recv() {
            tui.push_prompt(request);
        }
        while let Ok(notice) = channels.notice_rx.try_recv() {
            tui.push_notice(notice);
        }
        tui.tick();

        terminal.draw(|frame| tui.render(frame))?;

        if event::poll(Duration::from_millis(TUI_TICK_MS))? {
            if let TermEvent::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                match tui.handle_key(key) {
                    Action::None => {}
                    Action::Quit => {
                        let _ = shutdown_tx.send(());
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                    action => {
                        if let Err(error) = tui.perform_action(action) {
                            warn!(error = %error, "tui action failed");
                        }
                    }
                }
            }
        }
    }

    terminal.show_cursor()?;
    Ok(())
}

struct TerminalGuard;

impl TerminalGuard {
    fn enter() -> Result<Self, DynError> {
        enable_raw_mode()?;
        execute!(io::stdout(), EnterAlternateScreen)?;
        Ok(Self)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
    }
}

async fn run_export(args: &ExportArgs, export_dir: PathBuf) -> Result<ExportOutcome, DynError> {
    let contents = tokio::fs::read_to_string(&args.input)
        .await
        .map_err(|error| format!("failed to read {}: {error}", args.input.display()))?;
    let commands: Vec<Command> = serde_json::from_str(&contents)
        .map_err(|error| format!("failed to parse {}: {error}", args.input.display()))?;

    let mut store = CommandStore::new();
    let imported = store.import(commands)?;
    info!(path = %args.input.display(), commands = imported, "loaded timeline log");

    let kind = if args.api { ExportKind::ApiCalls } else { ExportKind::RawLog };
    let exporter = Exporter::new(
        PresetDestination(args.output.clone()),
        TokioFileWriter,
        LogNotices,
        export_dir,
        now_epoch_millis,
    );
    Ok(exporter.run(ExportJob { kind, commands: store.commands().to_vec() }).await?)
}

pub async fn run() -> Result<(), DynError> {
    init_tracing();

    let cli = Cli::parse();
    let cwd = env::current_dir()?;
    let env_map: BTreeMap<String, String> = env::vars().collect();
    let (config, config_path) = resolve_config(&cli, &cwd, &env_map)?;

    if let Some(path) = &config_path {
        info!(path = %path.display(), "loaded config file");
    } else {
        debug!("no {CONFIG_FILE_NAME} found, using defaults and env/cli overrides");
    }

    let export_dir = default_export_dir(config.export_dir.as_deref());

    if let Some(CliCommand::Export(args)) = &cli.command {
        run_export(args, export_dir).await?;
        return Ok(());
    }

    info!(
        enabled = config.enabled,
        host = %config.host,
        port = config.port,
        tui_enabled = config.tui_enabled,
        allow_remote = config.allow_remote,
        max_body_bytes = config.max_body_bytes,
        search_debounce_ms = config.search_debounce_ms,
        export_dir = %export_dir.display(),
        hidden_types = ?config.hidden_types,
        "resolved config"
    );

    if !config.enabled {
        warn!("strobe disabled via config/env");
        return Ok(());
    }

    let bus = StrobeBus::new();
    let timeline = config.build_timeline();
    let (shutdown_tx, _) = broadcast::channel(4);
    let mut shutdown_rx = shutdown_tx.subscribe();

    // Subscribe the timeline owner before the server accepts anything.
    let mut owner_handle = if config.tui_enabled {
        tokio::spawn(run_tui(timeline, export_dir, bus.clone(), shutdown_tx.subscribe(), shutdown_tx.clone()))
    } else {
        tokio::spawn(run_headless(timeline, bus.clone(), shutdown_tx.subscribe()))
    };
    let mut server_handle = tokio::spawn(run_server(config.clone(), bus, shutdown_tx.subscribe()));

    let mut server_result: Option<Result<(), DynError>> = None;
    let mut owner_result: Option<Result<(), DynError>> = None;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            let _ = shutdown_tx.send(());
        }
        _ = shutdown_rx.recv() => {}
        res = &mut server_handle => {
            server_result = Some(res?);
            let _ = shutdown_tx.send(());
        }
        res = &mut owner_handle => {
            owner_result = Some(res?);
            let _ = shutdown_tx.send(());
        }
    }

    // Every component must see the shutdown signal.
    let _ = shutdown_tx.send(());

    let owner_result = match owner_result {
        Some(result) => result,
        None => owner_handle.await?,
    };
    let server_result = match server_result {
        Some(result) => result,
        None => server_handle.await?,
    };

    owner_result?;
    server_result?;
    Ok(())
}
