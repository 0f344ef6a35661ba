mod settings;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use settings::{
    default_config_path, default_token_cache_path, init_config, load_or_default, read_live,
    replace_live, update_file, LiveConfig, MtimeMark,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use touchdeck_actions::{CommandExecutor, ExecEvent, ExecOutcome, RunHandle};
use touchdeck_core::format::ms_to_mmss;
use touchdeck_core::quick_actions::{resolve_quick_action, QuickActionRef, CUSTOM_PREFIX};
use touchdeck_core::{CustomQuickAction, DeckConfig, LyricsCache};
use touchdeck_engine::{DeckEngine, DeckFrame, DiffKind, EngineConfig};
use touchdeck_lyrics::{LrclibClient, LyricsResolver};
use touchdeck_providers::{build_registry, MediaManager, ProviderSet};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "touchdeck",
    about = "Now playing, media controls, synced lyrics and quick actions"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Poll the active provider and log frames; quick-action keys read from
    /// stdin are triggered as they arrive.
    Run,
    Status {
        #[arg(long)]
        json: bool,
        /// Wait for the lyrics lookup of the current track.
        #[arg(long)]
        lyrics: bool,
    },
    Devices,
    /// Sign in to Spotify.
    Auth,
    Control {
        #[command(subcommand)]
        action: ControlAction,
    },
    /// Trigger a quick action (`play_pause`, `next_track`, `prev_track` or a
    /// custom action key).
    Action { key: String },
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum ControlAction {
    PlayPause,
    Next,
    Previous,
    Seek {
        position_ms: u64,
    },
    Volume {
        #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
        percent: u8,
    },
    Transfer {
        device_id: String,
        #[arg(long)]
        play: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Init {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cmd = cli.command.unwrap_or(Commands::Run);
    let cfg_path = cli.config.unwrap_or_else(default_config_path);

    match cmd {
        Commands::Config {
            action: ConfigAction::Init { force },
        } => {
            if cfg_path.exists() && !force {
                bail!(
                    "{} already exists; pass --force to overwrite",
                    cfg_path.display()
                );
            }
            init_config(&cfg_path)?;
            println!("Initialized config at {}", cfg_path.display());
            Ok(())
        }
        Commands::Run => {
            let cfg = load_and_init_logging(&cfg_path)?;
            run(cfg, cfg_path).await
        }
        Commands::Status { json, lyrics } => {
            let cfg = load_and_init_logging(&cfg_path)?;
            status(cfg, &cfg_path, json, lyrics).await
        }
        Commands::Devices => {
            let cfg = load_and_init_logging(&cfg_path)?;
            devices(cfg).await
        }
        Commands::Auth => {
            let cfg = load_and_init_logging(&cfg_path)?;
            auth(cfg).await
        }
        Commands::Control { action } => {
            let cfg = load_and_init_logging(&cfg_path)?;
            control(cfg, &cfg_path, action).await
        }
        Commands::Action { key } => {
            let cfg = load_and_init_logging(&cfg_path)?;
            quick_action(cfg, &key).await
        }
    }
}

fn load_and_init_logging(path: &Path) -> Result<DeckConfig> {
    let cfg = load_or_default(path)?;
    init_logging(&cfg.log_level);
    Ok(cfg)
}

/// Live settings, the providers built from them and the façade in front.
struct Deck {
    live: LiveConfig,
    providers: ProviderSet,
    manager: Arc<MediaManager>,
}

impl Deck {
    fn new(cfg: DeckConfig) -> Self {
        let providers = build_registry(&cfg, default_token_cache_path());
        let live: LiveConfig = Arc::new(RwLock::new(cfg));
        let selector = {
            let live = live.clone();
            Arc::new(move || read_live(&live).media_provider.clone())
        };
        let manager = Arc::new(MediaManager::new(providers.registry.clone(), selector));
        Self {
            live,
            providers,
            manager,
        }
    }

    fn engine(&self) -> DeckEngine {
        let cfg = read_live(&self.live);
        let resolver = LyricsResolver::new(
            Arc::new(LrclibClient::new(cfg.lyrics.api_url.clone())),
            cfg.lyrics_cache.clone(),
        );
        DeckEngine::new(
            EngineConfig::from_deck_config(&cfg),
            self.manager.clone(),
            resolver,
        )
    }

    fn custom_actions(&self) -> Vec<CustomQuickAction> {
        read_live(&self.live).custom_actions.clone()
    }
}

async fn run(cfg: DeckConfig, cfg_path: PathBuf) -> Result<()> {
    let file_watch_poll_ms = cfg.intervals.file_watch_poll_ms;
    let deck = Deck::new(cfg);
    let mut engine = deck.engine();
    let (executor, mut exec_rx) = CommandExecutor::new();

    if let Some(msg) = deck.manager.ensure_ready().await {
        warn!(message = %msg, "media provider not ready");
    }
    info!(
        provider = %deck.manager.active_key(),
        config = %cfg_path.display(),
        "touchdeck started"
    );

    let mtime_mark = MtimeMark::new(&cfg_path);
    let (reload_tx, mut reload_rx) = mpsc::channel::<()>(4);
    spawn_reload_watchers(mtime_mark.clone(), file_watch_poll_ms, reload_tx).await?;
    let mut commands = spawn_stdin_commands();

    let mut next_poll_at = tokio::time::Instant::now();
    let mut last_lyric = String::new();

    // Registered once so a ctrl-c during a slow tick is still seen.
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(next_poll_at) => {
                let frame = engine.tick(Instant::now()).await;
                next_poll_at = tokio::time::Instant::now() + frame.next_poll_in;
                report_frame(&frame, &mut last_lyric);

                if engine.lyrics_mut().take_cache_dirty() {
                    let cache = engine.lyrics().cache().clone();
                    persist_lyrics_cache(cfg_path.clone(), cache, mtime_mark.clone()).await;
                }
            }
            Some(event) = exec_rx.recv() => report_exec_event(event),
            Some(line) = commands.recv() => {
                handle_command(&line, &deck, &executor).await;
                next_poll_at = tokio::time::Instant::now();
            }
            msg = reload_rx.recv() => {
                if msg.is_some() {
                    match load_or_default(&cfg_path) {
                        Ok(new_cfg) => {
                            let api_changed =
                                read_live(&deck.live).lyrics.api_url != new_cfg.lyrics.api_url;
                            deck.providers.apply_config(&new_cfg).await;
                            engine.update_config(EngineConfig::from_deck_config(&new_cfg));
                            if api_changed {
                                engine.lyrics_mut().set_source(Arc::new(LrclibClient::new(
                                    new_cfg.lyrics.api_url.clone(),
                                )));
                            }
                            replace_live(&deck.live, new_cfg);
                            info!("configuration reloaded");
                            next_poll_at = tokio::time::Instant::now();
                        }
                        Err(err) => {
                            error!(error = %err, "failed to reload config");
                        }
                    }
                }
            }
            _ = &mut ctrl_c => {
                info!("received ctrl-c; shutting down");
                for key in executor.running_keys() {
                    executor.cancel(&key);
                }
                break;
            }
        }
    }

    // Give canceled actions their terminate grace before the process exits.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !executor.running_keys().is_empty() {
        match tokio::time::timeout_at(deadline, exec_rx.recv()).await {
            Ok(Some(event)) => report_exec_event(event),
            _ => break,
        }
    }

    Ok(())
}

/// Writes the lyrics cache off the runtime threads.
async fn persist_lyrics_cache(path: PathBuf, cache: LyricsCache, mark: MtimeMark) {
    let written = tokio::task::spawn_blocking(move || {
        let result = update_file(&path, |c| c.lyrics_cache = cache);
        mark.record();
        result
    })
    .await;
    match written {
        Ok(Ok(())) => debug!("lyrics cache saved"),
        Ok(Err(err)) => warn!(error = %err, "failed to persist lyrics cache"),
        Err(err) => warn!(error = %err, "lyrics cache writer did not finish"),
    }
}

fn report_frame(frame: &DeckFrame, last_lyric: &mut String) {
    let state = &frame.state;
    if frame.diff != DiffKind::Nothing {
        match &state.message {
            Some(message) => warn!(provider = %state.source, status = %state.status, %message, "media state"),
            None => info!(
                provider = %state.source,
                status = %state.status,
                title = %state.title,
                artist = %state.artist,
                device = %state.device_name,
                "now playing"
            ),
        }
    }
    if frame.lyric_line != *last_lyric {
        info!(line = %frame.lyric_line, notice = frame.notice_active, "lyric");
        last_lyric.clone_from(&frame.lyric_line);
    }
}

fn report_exec_event(event: ExecEvent) {
    match event {
        ExecEvent::Output { key, line } => debug!(%key, %line, "action output"),
        ExecEvent::Finished {
            key,
            title,
            outcome,
        } => {
            let text = notification_text(&title, &outcome);
            if outcome.succeeded() {
                info!(%key, "{text}");
            } else {
                warn!(%key, "{text}");
            }
        }
    }
}

/// The line a shell would show for a finished action.
fn notification_text(title: &str, outcome: &ExecOutcome) -> String {
    let head = if outcome.timed_out {
        format!("{title} timed out")
    } else if outcome.canceled {
        format!("{title} was canceled")
    } else if outcome.succeeded() {
        format!("{title} finished")
    } else {
        match outcome.exit_code {
            Some(code) => format!("{title} failed (exit {code})"),
            None => format!("{title} failed"),
        }
    };
    if outcome.last_line.trim().is_empty() {
        head
    } else {
        format!("{head}: {}", outcome.last_line.trim())
    }
}

/// Reads quick-action keys (and `cancel <key>`) from stdin, one per line.
fn spawn_stdin_commands() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if tx.send(line.to_string()).await.is_err() {
                break;
            }
        }
    });
    rx
}

async fn handle_command(line: &str, deck: &Deck, executor: &CommandExecutor) {
    if let Some(key) = line.strip_prefix("cancel ") {
        let key = key.trim();
        let key = key.strip_prefix(CUSTOM_PREFIX).unwrap_or(key);
        if !executor.cancel(key) {
            info!(%key, "nothing to cancel");
        }
        return;
    }

    match trigger_quick_action(line, &deck.custom_actions(), &deck.manager, executor).await {
        Ok(Triggered::Control(None)) => debug!(key = %line, "quick action done"),
        Ok(Triggered::Control(Some(msg))) => warn!(key = %line, message = %msg, "quick action failed"),
        Ok(Triggered::Started(handle)) => debug!(key = %handle.key(), "quick action started"),
        Ok(Triggered::AlreadyRunning) => info!(key = %line, "quick action already running"),
        Err(err) => warn!(key = %line, error = %err, "quick action rejected"),
    }
}

enum Triggered {
    /// A built-in control ran; carries the user-facing error, if any.
    Control(Option<String>),
    Started(RunHandle),
    AlreadyRunning,
}

async fn trigger_quick_action(
    key: &str,
    custom: &[CustomQuickAction],
    manager: &MediaManager,
    executor: &CommandExecutor,
) -> Result<Triggered> {
    let target = match resolve_quick_action(key, custom) {
        Some(target) => target,
        None => match custom.iter().find(|a| a.key == key) {
            Some(action) => QuickActionRef::Custom(action),
            None => bail!("unknown quick action `{key}`"),
        },
    };

    match target {
        QuickActionRef::Builtin(builtin) => {
            let message = match builtin.key {
                "play_pause" => manager.play_pause().await,
                "next_track" => manager.next().await,
                "prev_track" => manager.previous().await,
                other => Some(format!("unsupported quick action `{other}`")),
            };
            Ok(Triggered::Control(message))
        }
        QuickActionRef::Custom(action) => {
            let state = manager.get_state().await;
            Ok(match executor.run(action, &state)? {
                Some(handle) => Triggered::Started(handle),
                None => Triggered::AlreadyRunning,
            })
        }
    }
}

async fn status(cfg: DeckConfig, cfg_path: &Path, json: bool, with_lyrics: bool) -> Result<()> {
    let deck = Deck::new(cfg);
    if let Some(msg) = deck.manager.ensure_ready().await {
        println!("note: {msg}");
    }
    let mut engine = deck.engine();
    let mut frame = engine.tick(Instant::now()).await;

    if with_lyrics {
        if let Some(settled) = engine.settle_lyrics().await {
            frame = settled;
        }
        if engine.lyrics_mut().take_cache_dirty() {
            let cache = engine.lyrics().cache().clone();
            update_file(cfg_path, |c| c.lyrics_cache = cache)?;
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&frame)?);
        return Ok(());
    }

    let s = &frame.state;
    println!("provider: {}", s.source);
    println!("status: {}", s.status);
    if let Some(message) = &s.message {
        println!("message: {message}");
    }
    if s.is_idle() {
        println!("track: <none>");
    } else {
        println!("track: {} - {}", s.artist, s.title);
        if !s.album.is_empty() {
            println!("album: {}", s.album);
        }
        println!(
            "position: {} / {}",
            ms_to_mmss(s.progress_ms),
            ms_to_mmss(s.duration_ms)
        );
    }
    if !s.device_name.is_empty() {
        println!("device: {}", s.device_name);
    }
    if let Some(volume) = s.volume_percent {
        println!("volume: {volume}%");
    }
    if with_lyrics {
        println!("lyrics: {:?}", frame.lyrics);
    }
    if !frame.lyric_line.is_empty() {
        println!("lyric: {}", frame.lyric_line);
    }
    Ok(())
}

async fn devices(cfg: DeckConfig) -> Result<()> {
    let deck = Deck::new(cfg);
    let devices = deck.manager.list_devices().await;
    if devices.is_empty() {
        println!("no devices");
        return Ok(());
    }
    for d in devices {
        let marker = if d.is_active { "*" } else { " " };
        let volume = d
            .volume_percent
            .map(|v| format!(" {v}%"))
            .unwrap_or_default();
        println!("{marker} {} [{}] {}{volume}", d.name, d.device_type, d.id);
    }
    Ok(())
}

async fn auth(mut cfg: DeckConfig) -> Result<()> {
    cfg.media_provider = "spotify".to_string();
    let deck = Deck::new(cfg);
    println!("Opening the Spotify sign-in page in your browser...");
    match deck.manager.authenticate().await {
        None => {
            println!("Signed in.");
            Ok(())
        }
        Some(msg) => bail!(msg),
    }
}

async fn control(cfg: DeckConfig, cfg_path: &Path, action: ControlAction) -> Result<()> {
    let deck = Deck::new(cfg);
    let m = &deck.manager;
    let result = match &action {
        ControlAction::PlayPause => m.play_pause().await,
        ControlAction::Next => m.next().await,
        ControlAction::Previous => m.previous().await,
        ControlAction::Seek { position_ms } => m.seek(*position_ms).await,
        ControlAction::Volume { percent } => m.set_volume(*percent).await,
        ControlAction::Transfer { device_id, play } => m.transfer_playback(device_id, *play).await,
    };
    if let Some(msg) = result {
        bail!(msg);
    }
    if let ControlAction::Transfer { device_id, .. } = action {
        update_file(cfg_path, |c| c.spotify.device_id = Some(device_id))?;
    }
    Ok(())
}

async fn quick_action(cfg: DeckConfig, key: &str) -> Result<()> {
    let deck = Deck::new(cfg);
    let (executor, mut events) = CommandExecutor::new();

    let handle =
        match trigger_quick_action(key, &deck.custom_actions(), &deck.manager, &executor).await? {
            Triggered::Control(None) => return Ok(()),
            Triggered::Control(Some(msg)) => bail!(msg),
            Triggered::AlreadyRunning => return Ok(()),
            Triggered::Started(handle) => handle,
        };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ExecEvent::Output { line, .. }) => println!("{line}"),
                Some(ExecEvent::Finished { title, outcome, .. }) => {
                    let text = notification_text(&title, &outcome);
                    if outcome.succeeded() {
                        eprintln!("{text}");
                        return Ok(());
                    }
                    bail!(text);
                }
                None => bail!("executor stopped unexpectedly"),
            },
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                handle.cancel();
            }
        }
    }
}

fn init_logging(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn spawn_reload_watchers(mark: MtimeMark, poll_ms: u64, tx: mpsc::Sender<()>) -> Result<()> {
    let tx_poll = tx.clone();
    tokio::spawn(async move {
        let sleep = Duration::from_millis(poll_ms.max(1_000));
        loop {
            tokio::time::sleep(sleep).await;
            let changed = tokio::task::spawn_blocking({
                let mark = mark.clone();
                move || mark.changed()
            })
            .await
            .unwrap_or(false);
            if changed && tx_poll.send(()).await.is_err() {
                break;
            }
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let tx_hup = tx.clone();
        tokio::spawn(async move {
            if let Ok(mut sig) = signal(SignalKind::hangup()) {
                while sig.recv().await.is_some() {
                    let _ = tx_hup.send(()).await;
                }
            }
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{notification_text, Cli, Commands, ControlAction};
    use clap::Parser;
    use touchdeck_actions::ExecOutcome;

    fn outcome(exit_code: Option<i32>, timed_out: bool, canceled: bool, last: &str) -> ExecOutcome {
        ExecOutcome {
            exit_code,
            timed_out,
            canceled,
            last_line: last.to_string(),
        }
    }

    #[test]
    fn notifications_distinguish_outcomes() {
        assert_eq!(
            notification_text("Lights", &outcome(Some(0), false, false, "on")),
            "Lights finished: on"
        );
        assert_eq!(
            notification_text("Lights", &outcome(None, true, false, "")),
            "Lights timed out"
        );
        assert_eq!(
            notification_text("Lights", &outcome(None, false, true, "")),
            "Lights was canceled"
        );
        assert_eq!(
            notification_text("Lights", &outcome(Some(2), false, false, "no bridge ")),
            "Lights failed (exit 2): no bridge"
        );
    }

    #[test]
    fn parses_control_commands() {
        let cli = Cli::try_parse_from(["touchdeck", "control", "seek", "65000"]).unwrap();
        match cli.command {
            Some(Commands::Control { action }) => {
                assert_eq!(action, ControlAction::Seek { position_ms: 65_000 })
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(Cli::try_parse_from(["touchdeck", "control", "volume", "101"]).is_err());
        assert!(Cli::try_parse_from(["touchdeck", "control", "transfer", "abc", "--play"]).is_ok());
    }

    #[test]
    fn defaults_to_run() {
        let cli = Cli::try_parse_from(["touchdeck"]).unwrap();
        assert!(cli.command.is_none());
    }
}
