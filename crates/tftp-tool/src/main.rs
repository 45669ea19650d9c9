//! TFTP Tool - Main executable
//!
//! Downloads, uploads and serves files over TFTP using the `tftp` engine.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use argh::FromArgs;
use tftp::{
    BlockSize, DEFAULT_PORT, Packet, PacketHook, STDIO_SENTINEL, SessionMetrics, Sink, Source, TftpClient, TftpOptions,
    TftpServer, TftpServerConfig, TransferConfig, TransferFailure,
};

const DEFAULT_BIND: &str = "0.0.0.0:6969"; // use 6969 for non-root testing; run as root for :69
const DEFAULT_ROOT: &str = "./tftp_root";

#[derive(FromArgs, Debug)]
#[argh(
    description = "TFTP client and server",
    example = "Download a file:\n  {command_name} get --host 10.0.1.50 pxelinux.0 ./pxelinux.0",
    example = "Upload from stdin with a larger block size:\n  {command_name} put --host 10.0.1.50 --blksize 1428 - config.txt",
    example = "Serve a directory:\n  {command_name} serve --bind 0.0.0.0:69 --root /tftpboot"
)]
struct CliConfig {
    #[argh(switch, short = 'v', description = "log every packet exchanged")]
    verbose: bool,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Get(GetArgs),
    Put(PutArgs),
    Serve(ServeArgs),
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "get", description = "download a file from a TFTP server")]
struct GetArgs {
    #[argh(option, short = 'H', description = "server host name or address")]
    host: String,

    #[argh(option, short = 'p', description = "server port", default = "DEFAULT_PORT")]
    port: u16,

    #[argh(option, short = 'b', description = "block size to request (8-65464)")]
    blksize: Option<u16>,

    #[argh(switch, description = "request the transfer size option")]
    tsize: bool,

    #[argh(option, short = 't', description = "seconds to wait before resending", default = "3")]
    timeout: u64,

    #[argh(option, short = 'r', description = "resends before giving up", default = "8")]
    retries: u32,

    #[argh(option, description = "local address for the transfer socket")]
    local_ip: Option<IpAddr>,

    #[argh(positional, description = "file name on the server")]
    remote: String,

    #[argh(positional, description = "local path, or - for stdout")]
    local: Option<PathBuf>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "put", description = "upload a file to a TFTP server")]
struct PutArgs {
    #[argh(option, short = 'H', description = "server host name or address")]
    host: String,

    #[argh(option, short = 'p', description = "server port", default = "DEFAULT_PORT")]
    port: u16,

    #[argh(option, short = 'b', description = "block size to request (8-65464)")]
    blksize: Option<u16>,

    #[argh(switch, description = "send the transfer size option")]
    tsize: bool,

    #[argh(option, short = 't', description = "seconds to wait before resending", default = "3")]
    timeout: u64,

    #[argh(option, short = 'r', description = "resends before giving up", default = "8")]
    retries: u32,

    #[argh(option, description = "local address for the transfer socket")]
    local_ip: Option<IpAddr>,

    #[argh(positional, description = "local path, or - for stdin")]
    local: PathBuf,

    #[argh(positional, description = "file name on the server")]
    remote: Option<String>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "serve", description = "serve a directory over TFTP")]
struct ServeArgs {
    #[argh(
        option,
        short = 'l',
        description = "server bind address",
        default = "DEFAULT_BIND.to_string()"
    )]
    bind: String,

    #[argh(
        option,
        short = 'r',
        description = "root directory",
        default = "PathBuf::from(DEFAULT_ROOT)"
    )]
    root: PathBuf,

    #[argh(option, short = 't', description = "seconds to wait before resending", default = "3")]
    timeout: u64,

    #[argh(option, description = "resends before giving up", default = "8")]
    retries: u32,

    #[argh(option, description = "local address for transfer sockets")]
    local_ip: Option<IpAddr>,

    #[argh(switch, description = "answer tsize with real file sizes")]
    report_tsize: bool,
}

/// Client settings common to get and put
struct ClientSettings {
    host: String,
    port: u16,
    blksize: Option<u16>,
    tsize: Option<u64>,
    transfer: TransferConfig,
}

impl ClientSettings {
    fn request_options(&self) -> Result<TftpOptions> {
        let mut options = TftpOptions::new();
        if let Some(size) = self.blksize {
            let size = BlockSize::parse(&size.to_string())
                .with_context(|| format!("Block size {} is outside {}-{}", size, BlockSize::MIN, BlockSize::MAX))?;
            options.insert("blksize", size.to_string());
        }
        if let Some(tsize) = self.tsize {
            options.insert("tsize", tsize.to_string());
        }
        Ok(options)
    }

    fn client(&self, verbose: bool) -> TftpClient {
        let client = TftpClient::new(self.host.clone(), self.port).with_config(self.transfer.clone());
        if verbose {
            let hook: PacketHook = Arc::new(|packet: &Packet| tracing::info!("Received {}", packet));
            client.with_hook(hook)
        } else {
            client
        }
    }
}

fn transfer_config(timeout: u64, retries: u32, local_ip: Option<IpAddr>) -> Result<TransferConfig> {
    if timeout == 0 {
        bail!("Timeout must be at least one second");
    }
    Ok(TransferConfig {
        timeout: Duration::from_secs(timeout),
        max_retries: retries,
        local_bind: local_ip,
    })
}

/// Log the outcome of a client transfer and turn a failure into an error
fn report(result: std::result::Result<SessionMetrics, TransferFailure>) -> Result<()> {
    match result {
        Ok(metrics) => {
            tracing::info!("Transfer complete: {}", metrics);
            Ok(())
        }
        Err(failure) => {
            tracing::error!("Transfer failed after {}", failure.metrics);
            Err(anyhow::Error::new(failure.error).context("TFTP transfer failed"))
        }
    }
}

async fn get(args: GetArgs, verbose: bool) -> Result<()> {
    let settings = ClientSettings {
        host: args.host,
        port: args.port,
        blksize: args.blksize,
        tsize: args.tsize.then_some(0),
        transfer: transfer_config(args.timeout, args.retries, args.local_ip)?,
    };
    let options = settings.request_options()?;

    let local = args.local.unwrap_or_else(|| PathBuf::from(&args.remote));
    let sink = Sink::create(&local)
        .await
        .with_context(|| format!("Failed to create {}", local.display()))?;

    report(settings.client(verbose).download(&args.remote, sink, options).await)
}

async fn put(args: PutArgs, verbose: bool) -> Result<()> {
    let remote = match args.remote {
        Some(remote) => remote,
        None => args
            .local
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| *name != STDIO_SENTINEL)
            .map(str::to_string)
            .context("A remote file name is required when uploading from stdin")?,
    };

    // Only regular files have a size worth announcing
    let tsize = if args.tsize {
        match tokio::fs::metadata(&args.local).await {
            Ok(meta) if meta.is_file() => Some(meta.len()),
            _ => Some(0),
        }
    } else {
        None
    };

    let settings = ClientSettings {
        host: args.host,
        port: args.port,
        blksize: args.blksize,
        tsize,
        transfer: transfer_config(args.timeout, args.retries, args.local_ip)?,
    };
    let options = settings.request_options()?;

    let source = Source::open(&args.local)
        .await
        .with_context(|| format!("Failed to open {}", args.local.display()))?;

    report(settings.client(verbose).upload(&remote, source, options).await)
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = TftpServerConfig {
        bind_address: args.bind,
        root_directory: args.root,
        transfer_config: transfer_config(args.timeout, args.retries, args.local_ip)?,
        report_transfer_size: args.report_tsize,
    };

    if !config.root_directory.is_dir() {
        bail!("Root directory {} does not exist", config.root_directory.display());
    }

    let mut server = TftpServer::new(config);
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr: stdout may carry file data
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli_config: CliConfig = argh::from_env();
    match cli_config.command {
        Command::Get(args) => get(args, cli_config.verbose).await,
        Command::Put(args) => put(args, cli_config.verbose).await,
        Command::Serve(args) => serve(args).await,
    }
}
