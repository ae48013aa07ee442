use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use player_remote::domain::models::{ConnectionEvent, ConnectionState, Device, SearchStrategy};
use player_remote::domain::settings::SettingsService;
use player_remote::infrastructure::comm::{
    platform_stack, BluetoothStack, Connection, DeviceScanner, ScanOutcome, UnavailableStack,
};
use player_remote::infrastructure::logging::init_logger;
use player_remote::presentation::commands::{describe, parse_line, RemoteCommand, HELP};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "player-remote", version, about = "Remote control for media player servers")]
struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Search for servers offering the player service
    Scan {
        /// Probe fallback channels when service lookup fails
        #[arg(long)]
        failsafe: bool,
        /// Only consider this address
        address: Option<String>,
    },
    /// Connect to a server and send commands read from stdin
    Connect(ConnectArgs),
    /// Manage remembered devices
    Devices {
        #[command(subcommand)]
        action: DevicesAction,
    },
}

#[derive(Args)]
struct ConnectArgs {
    /// Bluetooth address (12 hex digits) or, with --tcp, a host name
    address: String,
    /// RFCOMM channel or TCP port
    #[arg(short, long)]
    port: Option<u16>,
    /// Connect over TCP instead of Bluetooth
    #[arg(long)]
    tcp: bool,
    #[arg(long, value_enum, default_value_t = Search::Scan)]
    search: Search,
    /// Retry after failures and lost connections
    #[arg(long)]
    reconnect: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Search {
    Scan,
    Failsafe,
    Manual,
}

impl From<Search> for SearchStrategy {
    fn from(search: Search) -> Self {
        match search {
            Search::Scan => SearchStrategy::Scan,
            Search::Failsafe => SearchStrategy::ScanFailsafe,
            Search::Manual => SearchStrategy::Manual,
        }
    }
}

#[derive(Subcommand)]
enum DevicesAction {
    List,
    /// Forget one device
    Forget { address: String },
    /// Forget all devices
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match cli.settings {
        Some(path) => SettingsService::with_path(path),
        None => SettingsService::new()?,
    };
    let _guard = init_logger(&settings.get().log_settings)?;
    info!("Settings at {}", settings.path().display());

    match cli.command {
        Command::Scan { failsafe, address } => scan(&settings, failsafe, address).await,
        Command::Connect(args) => connect(&mut settings, args).await,
        Command::Devices { action } => devices(&mut settings, action),
    }
}

async fn scan(
    settings: &SettingsService,
    failsafe: bool,
    address: Option<String>,
) -> anyhow::Result<()> {
    let search = if failsafe {
        SearchStrategy::ScanFailsafe
    } else {
        SearchStrategy::Scan
    };
    let device = Device::bluetooth(address.unwrap_or_default(), search);
    device.validate()?;

    let stack = platform_stack(settings.get().connection.inquiry_window()).await;
    let scanner = DeviceScanner::new(stack, settings.get().connection.scan_config());
    let mut handle = scanner.start_scan(device);

    let outcome = tokio::select! {
        outcome = handle.outcome() => outcome,
        _ = tokio::signal::ctrl_c() => {
            handle.cancel();
            None
        }
    };
    match outcome {
        Some(ScanOutcome::Devices(found)) if found.is_empty() => println!("no devices found"),
        Some(ScanOutcome::Devices(found)) => {
            for d in found {
                println!(
                    "{}  {:?}  {}",
                    d.address,
                    d.endpoint,
                    d.name.as_deref().unwrap_or("")
                );
            }
        }
        Some(ScanOutcome::Failed(e)) => return Err(e).context("scan failed"),
        None => println!("scan cancelled"),
    }
    Ok(())
}

async fn connect(settings: &mut SettingsService, args: ConnectArgs) -> anyhow::Result<()> {
    let mut device = if args.tcp {
        let port = args.port.context("--port is required with --tcp")?;
        Device::socket(args.address, port)
    } else {
        let device = Device::bluetooth(args.address, args.search.into());
        match args.port {
            Some(port) => device.with_port(port),
            None => device,
        }
    };
    if let Some(known) = settings
        .known_devices()
        .iter()
        .find(|d| d.address.eq_ignore_ascii_case(&device.address))
    {
        device.name = known.name.clone();
    }

    let mut config = settings.get().connection.connection_config();
    config.auto_reconnect |= args.reconnect;

    let stack: Arc<dyn BluetoothStack> = if args.tcp {
        Arc::new(UnavailableStack)
    } else {
        platform_stack(settings.get().connection.inquiry_window()).await
    };

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut connection = Connection::new(
        stack,
        settings.get().connection.scan_config(),
        config,
        event_tx,
    );
    connection.connect(device.clone())?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                println!("{}", describe(&event));
                match event {
                    ConnectionEvent::PlayerInfo(info) => {
                        let name = device.name.clone().unwrap_or(info.name);
                        if let Err(e) = settings.remember_device(&device.address, Some(&name)) {
                            warn!("Could not remember device: {}", e);
                        }
                    }
                    ConnectionEvent::StateChanged(ConnectionState::Idle) => break,
                    _ => {}
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) => {
                        if !run_line(&connection, &line).await {
                            break;
                        }
                    }
                    None => stdin_open = false,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    connection.disconnect().await;
    Ok(())
}

/// Run one console line; `false` ends the session
async fn run_line(connection: &Connection, line: &str) -> bool {
    let command = match parse_line(line) {
        Ok(Some(command)) => command,
        Ok(None) => return true,
        Err(e) => {
            println!("{}", e);
            return true;
        }
    };

    let result = match command {
        RemoteCommand::Control(control) => connection.send_control(control).await,
        RemoteCommand::Action { id, targets } => connection.send_action(id, targets).await,
        RemoteCommand::Item(id) => connection.request_item(id).await,
        RemoteCommand::List { path, page } => connection.request_list(path, page).await,
        RemoteCommand::Help => {
            println!("{}", HELP);
            Ok(())
        }
        RemoteCommand::Quit => return false,
    };
    if let Err(e) = result {
        error!("Command failed: {}", e);
        println!("error: {}", e);
    }
    true
}

fn devices(settings: &mut SettingsService, action: DevicesAction) -> anyhow::Result<()> {
    let mut known = settings.known_devices();
    match action {
        DevicesAction::List => {
            if known.is_empty() {
                println!("no known devices");
            }
            for d in known.iter() {
                println!("{}  {}", d.address, d.name.as_deref().unwrap_or(""));
            }
            return Ok(());
        }
        DevicesAction::Forget { address } => {
            if !known.remove(&address) {
                anyhow::bail!("unknown device {}", address);
            }
        }
        DevicesAction::Clear => known.clear(),
    }
    settings.set_known_devices(&known)
}
