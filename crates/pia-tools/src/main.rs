//! pia: WireGuard tunnels and port forwarding for Private Internet Access
//!
//! Three subcommands, each a single pass meant to be run by hand or from a
//! timer:
//! - `regions` lists the provider's regions, fastest first
//! - `setup` registers a tunnel and writes its systemd-networkd files
//! - `forward` obtains or refreshes the forwarded port and updates torrent
//!   clients

mod config;
mod consumers;
mod networkd;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use pia_network::HttpClient;
use pia_vpn::{
    Credentials, IcmpProbe, NativeKeyGenerator, Region, RegionSelector, Session, SessionManager,
    SessionStore, WgToolKeyGenerator,
};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::{AppConfig, ConfigError, DEFAULT_CONFIG_PATH, RtorrentSection, TransmissionSection};
use networkd::NetworkdWriter;

/// PIA WireGuard session and port-forward tool
#[derive(Debug, Parser)]
#[command(name = "pia", author, version, about, long_about = None)]
struct Cli {
    /// Configuration file [default: /etc/pia/pia.toml]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Interface name; also names the cached session
    #[arg(short, long, global = true)]
    interface: Option<String>,

    /// Directory holding cached sessions
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(flatten)]
    account: AccountArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct AccountArgs {
    /// PIA username
    #[arg(short, long, global = true, env = "PIA_USERNAME")]
    username: Option<String>,

    /// PIA password
    #[arg(short, long, global = true, env = "PIA_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List regions with their latency and capabilities
    Regions,
    /// Register a WireGuard tunnel and write its networkd files
    Setup(SetupArgs),
    /// Obtain or refresh the forwarded port
    Forward(ForwardArgs),
}

#[derive(Debug, Args)]
struct SetupArgs {
    /// Region id, or "auto" for the fastest region with port forwarding
    #[arg(short, long)]
    region: Option<String>,

    /// Directory for the .netdev/.network files
    #[arg(long)]
    networkd_dir: Option<PathBuf>,

    /// Template for the .netdev file
    #[arg(long)]
    netdev_template: Option<PathBuf>,

    /// Template for the .network file
    #[arg(long)]
    network_template: Option<PathBuf>,

    /// Only register and cache the session
    #[arg(long)]
    no_networkd: bool,
}

#[derive(Debug, Args)]
struct ForwardArgs {
    /// Rebind the cached assignment instead of requesting a new one
    #[arg(long)]
    refresh: bool,

    /// Notify Transmission at this URL
    #[arg(long)]
    transmission: Option<String>,

    #[arg(long, requires = "transmission")]
    transmission_username: Option<String>,

    #[arg(long, requires = "transmission")]
    transmission_password: Option<String>,

    /// Notify rTorrent's XML-RPC at this URL
    #[arg(long)]
    rtorrent: Option<String>,
}

impl Cli {
    /// Flags win over the configuration file
    fn apply(&self, config: &mut AppConfig) {
        if let Some(interface) = &self.interface {
            config.interface = interface.clone();
        }
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = dir.clone();
        }
        if let Some(username) = &self.account.username {
            config.username = Some(username.clone());
        }
        if let Some(password) = &self.account.password {
            config.password = Some(password.clone());
        }

        match &self.command {
            Commands::Regions => {}
            Commands::Setup(args) => {
                if let Some(region) = &args.region {
                    config.region = region.clone();
                }
                if let Some(dir) = &args.networkd_dir {
                    config.networkd.dir = dir.clone();
                }
                if let Some(template) = &args.netdev_template {
                    config.networkd.netdev.template = Some(template.clone());
                }
                if let Some(template) = &args.network_template {
                    config.networkd.network.template = Some(template.clone());
                }
            }
            Commands::Forward(args) => {
                if let Some(url) = &args.transmission {
                    config.transmission = Some(TransmissionSection {
                        url: url.clone(),
                        username: args.transmission_username.clone(),
                        password: args.transmission_password.clone(),
                    });
                }
                if let Some(url) = &args.rtorrent {
                    config.rtorrent = Some(RtorrentSection { url: url.clone() });
                }
            }
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn credentials(config: &AppConfig) -> Option<Credentials> {
    match (&config.username, &config.password) {
        (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
            Some(Credentials::new(username, password))
        }
        _ => None,
    }
}

fn session_manager(
    config: &AppConfig,
) -> Result<SessionManager<HttpClient, IcmpProbe>, ConfigError> {
    Ok(SessionManager::new(
        HttpClient::new(config.http.client_config()),
        IcmpProbe::new(config.probe.probe_config()),
        SessionStore::new(&config.cache_dir),
    )
    .with_catalog_url(config.catalog_url.as_str())
    .with_token_validity(config.token_validity()?))
}

/// `ID NAME PING WG? PF?`, one region per line
fn format_regions(regions: &[Region]) -> String {
    let id_width = regions.iter().map(|r| r.id.len()).max().unwrap_or(0).max(2);
    let name_width = regions.iter().map(|r| r.name.len()).max().unwrap_or(0).max(4);
    let yes_no = |flag: bool| if flag { "yes" } else { "no" };

    let mut out = format!(
        "{:<id_width$}  {:<name_width$}  {:>7}  {:<3}  {:<3}\n",
        "ID", "NAME", "PING", "WG?", "PF?"
    );
    for region in regions {
        let ping = match region.latency {
            Some(latency) if region.is_reachable() => format!("{}ms", latency.as_millis()),
            _ => "N/A".to_string(),
        };
        out.push_str(&format!(
            "{:<id_width$}  {:<name_width$}  {:>7}  {:<3}  {:<3}\n",
            region.id,
            region.name,
            ping,
            yes_no(region.has_tunnel()),
            yes_no(region.port_forward),
        ));
    }
    out
}

fn describe_session(session: &Session) -> String {
    match &session.params {
        Some(params) => format!(
            "{} ({}): peer {} via {}",
            session.name,
            session.region.id,
            params.peer_ip,
            params.endpoint()
        ),
        None => format!("{} ({}): not registered", session.name, session.region.id),
    }
}

async fn run_regions(config: &AppConfig) -> Result<()> {
    let regions = session_manager(config)?
        .list_regions()
        .await
        .context("Could not list regions")?;
    print!("{}", format_regions(&regions));
    Ok(())
}

async fn run_setup(config: &AppConfig, args: &SetupArgs) -> Result<()> {
    let Some(credentials) = credentials(config) else {
        bail!("Username and/or password were not provided");
    };
    let selector: RegionSelector = config.region.parse()?;
    let manager = session_manager(config)?;

    let session = match &config.wg_binary {
        Some(binary) => {
            debug!("Generating keys with {}", binary.display());
            manager
                .setup(
                    &config.interface,
                    &selector,
                    &credentials,
                    &WgToolKeyGenerator::new(binary),
                )
                .await
        }
        None => {
            manager
                .setup(&config.interface, &selector, &credentials, &NativeKeyGenerator)
                .await
        }
    }
    .with_context(|| format!("Could not set up tunnel {}", config.interface))?;

    if !args.no_networkd {
        let writer = NetworkdWriter::new(
            &config.networkd.dir,
            config.networkd.netdev.file_spec()?,
            config.networkd.network.file_spec()?,
        );
        writer
            .write(&session)
            .await
            .context("Could not write networkd files")?;
    }

    println!("{}", describe_session(&session));
    Ok(())
}

async fn run_forward(config: &AppConfig, args: &ForwardArgs) -> Result<()> {
    let credentials = credentials(config);
    let consumers = consumers::from_config(config, &config.http.client_config());
    info!(
        "Forwarding for {} ({} consumers, refresh only: {})",
        config.interface,
        consumers.len(),
        args.refresh
    );

    let outcome = session_manager(config)?
        .forward(
            &config.interface,
            credentials.as_ref(),
            args.refresh,
            &consumers,
        )
        .await
        .with_context(|| format!("Port forwarding for {} failed", config.interface))?;

    println!("{outcome}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let explicit = cli.config.is_some();
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = AppConfig::load(&path, explicit)?;
    cli.apply(&mut config);
    debug!("Configuration: {:?}", RedactedConfig(&config));

    match &cli.command {
        Commands::Regions => run_regions(&config).await,
        Commands::Setup(args) => run_setup(&config, args).await,
        Commands::Forward(args) => run_forward(&config, args).await,
    }
}

/// Debug view of the configuration without secrets
struct RedactedConfig<'a>(&'a AppConfig);

impl std::fmt::Debug for RedactedConfig<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let config = self.0;
        f.debug_struct("AppConfig")
            .field("username", &config.username)
            .field("region", &config.region)
            .field("interface", &config.interface)
            .field("cache_dir", &config.cache_dir)
            .field("catalog_url", &config.catalog_url)
            .field("wg_binary", &config.wg_binary)
            .finish_non_exhaustive()
    }
}
