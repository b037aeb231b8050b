use std::future::Future;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::display::{GameRow, MetricsRow, NetworkRow, PeerRow, SummaryRow};
use crate::logging::{self, LogFormat};
use crate::output::{self, OutputFormat};
use crate::ui;

use lobby_core::config::LobbyConfig;
use lobby_core::naming;
use lobby_core::process::{GameProcess, GameSpec, ProcessStatus};
use lobby_core::vpn::VpnSession;
use lobby_runtime::metrics::Counters;
use lobby_runtime::process::ProcessSupervisor;
use lobby_runtime::sweep::spawn_sweeps;
use lobby_runtime::vpn::{self, InstallPlan, VpnManager, install};

#[derive(Parser)]
#[command(
    name = "lobbyctl",
    version,
    about = "Game process supervisor and WireGuard overlay manager for LAN game lobbies"
)]
struct Cli {
    /// Configuration file (TOML). Falls back to $LOBBY_CONFIG, then defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format: table, json
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: String,

    /// Log format (default: json for `serve`, human otherwise)
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor and overlay sweeps until Ctrl-C
    Serve,
    /// Launch one game executable under supervision and follow it until it exits
    Run {
        /// Path to the game executable
        executable: PathBuf,
        /// Game session the process belongs to
        #[arg(long, default_value = "local")]
        session: String,
        /// User the process is launched for
        #[arg(long, default_value = "host")]
        user: String,
        /// Game identifier (default: executable file name)
        #[arg(long)]
        game_id: Option<String>,
        /// Working directory (default: the executable's directory)
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Arguments passed verbatim to the game
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Overlay network tools
    Vpn {
        #[command(subcommand)]
        action: VpnCmd,
    },
    /// Check for WireGuard tooling on this host
    Doctor,
    /// Install WireGuard tooling using the detected package manager
    InstallWireguard {
        /// Run the install instead of only printing the plan
        #[arg(long)]
        yes: bool,
    },
    /// Print the effective configuration
    Config {
        /// Print built-in defaults instead of the loaded configuration
        #[arg(long)]
        defaults: bool,
    },
}

#[derive(Subcommand)]
enum VpnCmd {
    /// Provision an overlay in memory and show its addressing; nothing is activated
    Plan {
        /// Game session ID
        session: String,
        /// Participant user IDs, in address order
        #[arg(required = true)]
        participants: Vec<String>,
        /// Print this participant's client configuration
        #[arg(long, requires = "endpoint")]
        user: Option<String>,
        /// Host's externally reachable address (host or host:port)
        #[arg(long)]
        endpoint: Option<String>,
    },
    /// Provision and activate an overlay, write client configs, and hold it up until Ctrl-C
    Up {
        /// Game session ID
        session: String,
        /// Participant user IDs, in address order
        #[arg(required = true)]
        participants: Vec<String>,
        /// Host's externally reachable address (host or host:port)
        #[arg(long)]
        endpoint: String,
        /// Directory for the per-participant client configs
        #[arg(long)]
        out_dir: PathBuf,
    },
}

// ============================================================================
// Command dispatch
// ============================================================================

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    // JSON for the long-running host, human-readable for everything else
    let log_format = cli.log_format.unwrap_or(match cli.command {
        Commands::Serve => LogFormat::Json,
        _ => LogFormat::Human,
    });
    logging::init(log_format);

    let out_fmt = OutputFormat::from_str_arg(&cli.output);
    let config = LobbyConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => cmd_serve(config),
        Commands::Run {
            executable,
            session,
            user,
            game_id,
            cwd,
            args,
        } => cmd_run(
            config,
            RunArgs {
                executable,
                session,
                user,
                game_id,
                cwd,
                args,
            },
            out_fmt,
        ),
        Commands::Vpn { action } => cmd_vpn(config, action, out_fmt),
        Commands::Doctor => cmd_doctor(config, out_fmt),
        Commands::InstallWireguard { yes } => cmd_install_wireguard(yes),
        Commands::Config { defaults } => cmd_config(config, defaults, out_fmt),
    }
}

fn block_on<F: Future>(f: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .with_context(|| "Failed to create tokio runtime")?;
    Ok(runtime.block_on(f))
}

fn supervisor_for(config: &LobbyConfig, counters: &Arc<Counters>) -> Arc<ProcessSupervisor> {
    Arc::new(ProcessSupervisor::new(
        config.supervisor.clone(),
        config.health.clone(),
        Arc::clone(counters),
    ))
}

// ============================================================================
// serve
// ============================================================================

fn cmd_serve(config: LobbyConfig) -> Result<()> {
    block_on(async move {
        let counters = Arc::new(Counters::new());
        let supervisor = supervisor_for(&config, &counters);
        let vpn = Arc::new(vpn::wg_quick_manager(config.vpn.clone(), Arc::clone(&counters)));

        let availability = vpn.check_wireguard_availability().await;
        if !availability.installed {
            warn!("WireGuard tooling not found; overlay activation will fail until it is installed");
        }

        let sweeps = spawn_sweeps(Arc::clone(&supervisor), Arc::clone(&vpn), &config);
        info!(
            config_dir = %config.vpn.config_dir.display(),
            pool = %config.vpn.address_pool,
            "lobbyctl serving"
        );

        tokio::signal::ctrl_c()
            .await
            .with_context(|| "Failed to listen for ctrl-c")?;

        info!("Shutdown signal received, stopping sweeps...");
        sweeps.shutdown().await;
        shutdown_all(&supervisor, &vpn).await;

        let snapshot = counters.snapshot();
        info!(
            launches = snapshot.launches,
            crashes = snapshot.crashes,
            vpn_activations = snapshot.vpn_activations,
            "Final counters"
        );
        Ok::<_, anyhow::Error>(())
    })?
}

/// Terminate every live game and take every active overlay down.
async fn shutdown_all(supervisor: &ProcessSupervisor, vpn: &VpnManager) {
    for process in supervisor.update_all_process_statuses().await {
        if !process.is_terminal() {
            supervisor
                .terminate_game(&process.session_id, &process.user_id)
                .await;
        }
    }
    for session in vpn.get_active_vpn_sessions().await {
        if let Err(e) = vpn.stop_vpn_network(&session.network_id).await {
            warn!(network_id = %session.network_id, error = %e, "Failed to stop overlay on shutdown");
        }
    }
}

// ============================================================================
// run
// ============================================================================

struct RunArgs {
    executable: PathBuf,
    session: String,
    user: String,
    game_id: Option<String>,
    cwd: Option<PathBuf>,
    args: Vec<String>,
}

fn game_spec(run: &RunArgs) -> Result<GameSpec> {
    let game_id = match &run.game_id {
        Some(id) => id.clone(),
        None => run
            .executable
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .with_context(|| format!("Cannot derive a game id from {}", run.executable.display()))?,
    };
    let mut spec = GameSpec::new(game_id, run.executable.clone());
    spec.working_directory = run.cwd.clone();
    Ok(spec)
}

fn cmd_run(config: LobbyConfig, run: RunArgs, out_fmt: OutputFormat) -> Result<()> {
    naming::validate_id(&run.session, "session")?;
    naming::validate_id(&run.user, "user")?;
    let spec = game_spec(&run)?;

    let final_record = block_on(async move {
        let counters = Arc::new(Counters::new());
        let supervisor = supervisor_for(&config, &counters);

        let record = supervisor
            .launch(&run.session, &run.user, &spec, run.args.clone())
            .await?;
        let pid = record.process_id;
        ui::info(&format!("Launched {} (pid {})", spec.game_id, pid));

        let mut poll = tokio::time::interval(Duration::from_secs(config.supervisor.poll_interval_secs));
        let mut sample =
            tokio::time::interval(Duration::from_secs(config.supervisor.metrics_interval_secs));
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let finished = loop {
            tokio::select! {
                _ = poll.tick() => {
                    let games = supervisor.get_all_user_games(&run.user).await;
                    if let Some(done) = find_finished(&games, &run.session, pid) {
                        break Some(done);
                    }
                }
                _ = sample.tick() => {
                    supervisor.sample_metrics().await;
                    if let Ok(Some(sample)) = supervisor.get_process_metrics(pid).await {
                        info!(
                            pid,
                            cpu = sample.cpu_usage_percent,
                            memory_bytes = sample.memory_usage_bytes,
                            health = sample.health_score,
                            "Resource sample"
                        );
                    }
                }
                _ = &mut ctrl_c => {
                    ui::warn("Interrupted, terminating game...");
                    supervisor.terminate_game(&run.session, &run.user).await;
                    break supervisor.get_process(&run.session, &run.user).await;
                }
            }
        };
        let finished = finished.with_context(|| format!("Lost track of pid {}", pid))?;

        let summary = supervisor.get_session_health_summary(&run.session).await;
        let metrics = supervisor.get_all_metrics().await;
        Ok::<_, anyhow::Error>((finished, summary, metrics))
    })??;

    let (record, summary, metrics) = final_record;
    output::render_one(&GameRow::from(&record), out_fmt);
    if out_fmt == OutputFormat::Table {
        let rows: Vec<MetricsRow> = metrics.iter().map(MetricsRow::from).collect();
        if !rows.is_empty() {
            println!();
            output::render_list(&rows, out_fmt);
        }
        println!();
        output::render_one(&SummaryRow::from(&summary), out_fmt);
    }

    match record.status() {
        ProcessStatus::Crashed => bail!(
            "{} crashed (exit code {})",
            record.game_id,
            record
                .exit_code()
                .map_or_else(|| "unknown".to_string(), |c| c.to_string())
        ),
        ProcessStatus::Terminated => ui::warn(&format!("{} terminated", record.game_id)),
        _ => ui::success(&format!("{} exited cleanly", record.game_id)),
    }
    Ok(())
}

/// The finished record for `pid` in `session`, if it has reached a terminal state.
fn find_finished(games: &[GameProcess], session: &str, pid: u32) -> Option<GameProcess> {
    games
        .iter()
        .find(|g| g.session_id == session && g.process_id == pid && g.is_terminal())
        .cloned()
}

// ============================================================================
// vpn
// ============================================================================

fn validate_participants(session: &str, participants: &[String]) -> Result<()> {
    naming::validate_id(session, "session")?;
    for user in participants {
        naming::validate_id(user, "user")?;
    }
    Ok(())
}

fn cmd_vpn(config: LobbyConfig, action: VpnCmd, out_fmt: OutputFormat) -> Result<()> {
    match action {
        VpnCmd::Plan {
            session,
            participants,
            user,
            endpoint,
        } => cmd_vpn_plan(config, &session, &participants, user, endpoint, out_fmt),
        VpnCmd::Up {
            session,
            participants,
            endpoint,
            out_dir,
        } => cmd_vpn_up(config, &session, &participants, &endpoint, &out_dir),
    }
}

fn cmd_vpn_plan(
    config: LobbyConfig,
    session: &str,
    participants: &[String],
    user: Option<String>,
    endpoint: Option<String>,
    out_fmt: OutputFormat,
) -> Result<()> {
    validate_participants(session, participants)?;

    block_on(async move {
        let vpn = vpn::wg_quick_manager(config.vpn.clone(), Arc::new(Counters::new()));
        let network = vpn.create_vpn_network(session, participants).await?;
        vpn.start_vpn_network(&network.network_id).await?;

        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .with_context(|| "Failed to listen for ctrl-c")
        };
        serve_network(&vpn, &network, endpoint, out_dir, ctrl_c).await?;
        ui::success(&format!("{} stopped", network.network_id));
        Ok::<_, anyhow::Error>(())
    })?
}

/// Hand out every participant's config, hold the tunnel up until `until`
/// resolves, then take it down and drop the network. The teardown also runs
/// when handing out configs fails part way.
async fn serve_network(
    vpn: &VpnManager,
    network: &VpnSession,
    endpoint: &str,
    out_dir: &Path,
    until: impl Future<Output = Result<()>>,
) -> Result<()> {
    let served = async {
        for user in &network.participants {
            let bundle = vpn
                .get_client_config(&network.network_id, user, endpoint)
                .await?;
            let path = out_dir.join(&bundle.file_name);
            write_private(&path, bundle.config.as_str())?;
            ui::info(&format!("{} -> {} ({})", user, path.display(), bundle.ip_address));
        }

        let headline = format!("{} is up", network.network_id);
        let listen = format!(
            "{} on {}:{}",
            network.interface, network.server_address, network.server_port
        );
        ui::banner(&[headline.as_str(), listen.as_str(), "Press Ctrl-C to take it down"]);
        until.await
    }
    .await;

    if served.is_err() {
        warn!(network_id = %network.network_id, "Taking the overlay down after a failure");
    }
    let stopped = vpn.stop_vpn_network(&network.network_id).await;
    vpn.mark_session_ended(&network.session_id).await;
    vpn.cleanup_inactive_sessions().await;

    served?;
    stopped?;
    Ok(())
}

/// Write a client config readable only by the owner.
fn write_private(path: &Path, contents: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))
}

// ============================================================================
// doctor / install-wireguard / config
// ============================================================================

fn cmd_doctor(config: LobbyConfig, out_fmt: OutputFormat) -> Result<()> {
    let report = install::check();
    if out_fmt == OutputFormat::Json {
        output::render_json(&report);
        return Ok(());
    }

    let path_or_dash = |p: &Option<PathBuf>| {
        p.as_ref()
            .map_or_else(|| "-".to_string(), |p| p.display().to_string())
    };
    ui::status_header("lobby doctor");
    ui::status_line("WireGuard:", if report.installed { "yes" } else { "no" });
    ui::status_line("wg:", &path_or_dash(&report.wg_path));
    ui::status_line("wg-quick:", &path_or_dash(&report.wg_quick_path));
    ui::status_line("Version:", report.version.as_deref().unwrap_or("-"));
    ui::status_line("Config dir:", &config.vpn.config_dir.display().to_string());
    ui::status_line("Address pool:", &config.vpn.address_pool.to_string());
    if let Some(plan) = &report.install_plan {
        ui::warn(&format!(
            "Install with: {} (or run 'lobbyctl install-wireguard --yes')",
            plan.describe()
        ));
    }
    Ok(())
}

fn cmd_install_wireguard(yes: bool) -> Result<()> {
    let report = install::check();
    if report.installed {
        ui::success(&format!(
            "WireGuard already installed ({})",
            report.version.as_deref().unwrap_or("unknown version")
        ));
        return Ok(());
    }

    let plan = install::install_plan();
    if !yes {
        ui::info(&format!("Would run: {}", plan.describe()));
        if let InstallPlan::Script { script } = &plan {
            println!("{}", script);
        }
        ui::info("Re-run with --yes to install.");
        return Ok(());
    }

    if let Err(e) = install::install(&plan) {
        ui::error(&format!("Install failed: {:#}", e));
        return Err(e);
    }
    if !install::check().installed {
        bail!("Install finished but wg/wg-quick are still not on PATH");
    }
    ui::success("WireGuard installed.");
    Ok(())
}

fn cmd_config(config: LobbyConfig, defaults: bool, out_fmt: OutputFormat) -> Result<()> {
    let config = if defaults { LobbyConfig::default() } else { config };
    match out_fmt {
        OutputFormat::Json => output::render_json(&config),
        OutputFormat::Table => print!("{}", config.to_toml()?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lobby_core::config::VpnConfig;
    use lobby_core::process::ProcessState;
    use lobby_runtime::vpn::{TunnelBackend, TunnelError};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingTunnel {
        calls: StdMutex<Vec<&'static str>>,
    }

    impl TunnelBackend for RecordingTunnel {
        fn up(&self, _config_path: &Path) -> Result<(), TunnelError> {
            self.calls.lock().unwrap().push("up");
            Ok(())
        }

        fn down(&self, _config_path: &Path) -> Result<(), TunnelError> {
            self.calls.lock().unwrap().push("down");
            Ok(())
        }
    }

    fn recording_manager(dir: &Path, tunnel: Arc<RecordingTunnel>) -> VpnManager {
        let config = VpnConfig {
            config_dir: dir.join("wg"),
            ..VpnConfig::default()
        };
        VpnManager::new(config, tunnel, Arc::new(Counters::new()))
    }

    #[tokio::test]
    async fn test_serve_network_tears_down_when_configs_cannot_be_written() {
        let dir = tempfile::tempdir().unwrap();
        let tunnel = Arc::new(RecordingTunnel::default());
        let vpn = recording_manager(dir.path(), tunnel.clone());
        let network = vpn
            .create_vpn_network("s1", &["alice".to_string()])
            .await
            .unwrap();
        vpn.start_vpn_network(&network.network_id).await.unwrap();

        // A plain file where the output directory should be.
        let blocker = dir.path().join("out");
        std::fs::write(&blocker, b"").unwrap();
        let until = async { Err::<(), _>(anyhow::anyhow!("held the tunnel without configs")) };
        let err = serve_network(&vpn, &network, "203.0.113.7", &blocker, until)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to create"));

        assert_eq!(*tunnel.calls.lock().unwrap(), vec!["up", "down"]);
        assert!(vpn.list_vpn_sessions().await.is_empty());
        assert!(!dir.path().join("wg").join("lobby0.conf").exists());
    }

    #[tokio::test]
    async fn test_serve_network_writes_configs_then_stops() {
        let dir = tempfile::tempdir().unwrap();
        let tunnel = Arc::new(RecordingTunnel::default());
        let vpn = recording_manager(dir.path(), tunnel.clone());
        let network = vpn
            .create_vpn_network("s1", &["alice".to_string(), "bob".to_string()])
            .await
            .unwrap();
        vpn.start_vpn_network(&network.network_id).await.unwrap();

        let out = dir.path().join("clients");
        serve_network(&vpn, &network, "203.0.113.7", &out, async { Ok(()) })
            .await
            .unwrap();

        let alice = std::fs::read_to_string(out.join("lobby-s1-alice.conf")).unwrap();
        assert!(alice.contains("Endpoint = 203.0.113.7:51820"));
        assert!(out.join("lobby-s1-bob.conf").exists());
        assert_eq!(*tunnel.calls.lock().unwrap(), vec!["up", "down"]);
        assert!(vpn.list_vpn_sessions().await.is_empty());
    }

    #[test]
    fn test_parse_run_with_trailing_args() {
        let cli = Cli::try_parse_from([
            "lobbyctl", "run", "/opt/game/game", "--session", "s1", "--", "-fullscreen", "+map",
            "e1m1",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                executable,
                session,
                user,
                args,
                ..
            } => {
                assert_eq!(executable, PathBuf::from("/opt/game/game"));
                assert_eq!(session, "s1");
                assert_eq!(user, "host");
                assert_eq!(args, vec!["-fullscreen", "+map", "e1m1"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_vpn_plan_user_requires_endpoint() {
        assert!(Cli::try_parse_from(["lobbyctl", "vpn", "plan", "s1", "alice", "--user", "alice"])
            .is_err());
        assert!(Cli::try_parse_from([
            "lobbyctl", "vpn", "plan", "s1", "alice", "--user", "alice", "--endpoint", "1.2.3.4"
        ])
        .is_ok());
        assert!(Cli::try_parse_from(["lobbyctl", "vpn", "plan", "s1"]).is_err());
    }

    #[test]
    fn test_global_flags() {
        let cli =
            Cli::try_parse_from(["lobbyctl", "doctor", "-o", "json", "--log-format", "json"]).unwrap();
        assert_eq!(OutputFormat::from_str_arg(&cli.output), OutputFormat::Json);
        assert_eq!(cli.log_format, Some(LogFormat::Json));
    }

    #[test]
    fn test_game_spec_defaults_id_to_file_stem() {
        let run = RunArgs {
            executable: PathBuf::from("/opt/quake/quake.x86"),
            session: "s1".into(),
            user: "alice".into(),
            game_id: None,
            cwd: None,
            args: vec![],
        };
        let spec = game_spec(&run).unwrap();
        assert_eq!(spec.game_id, "quake");
        assert_eq!(spec.working_directory, None);
    }

    #[test]
    fn test_find_finished_ignores_live_and_other_pids() {
        let mk = |pid: u32, state: ProcessState| GameProcess {
            process_id: pid,
            session_id: "s1".into(),
            user_id: "alice".into(),
            game_id: "g".into(),
            executable_path: PathBuf::from("/bin/true"),
            launch_arguments: vec![],
            working_directory: PathBuf::from("/"),
            state,
            start_time: Utc::now(),
            last_health_check: None,
        };
        let exited = ProcessState::Exited {
            exit_code: 0,
            ended_at: Utc::now(),
        };
        let games = vec![mk(1, ProcessState::Launching), mk(2, exited)];
        assert!(find_finished(&games, "s1", 1).is_none());
        assert!(find_finished(&games, "s1", 3).is_none());
        assert!(find_finished(&games, "s2", 2).is_none());
        assert_eq!(find_finished(&games, "s1", 2).unwrap().exit_code(), Some(0));
    }

    #[test]
    fn test_write_private_sets_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("lobby-s1-alice.conf");
        write_private(&path, "[Interface]\n").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[Interface]\n");
    }
}
