use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use zerocloud_lib::config::{self, DEFAULT_TRANSPORT_PORT, SERVICE_NAME};
use zerocloud_lib::crypto::DEFAULT_PASSPHRASE;
use zerocloud_lib::resolver::Resolver;
use zerocloud_lib::sender::MessageSender;
use zerocloud_lib::{ChatMessage, Cipher, Event, EventSink, Node, NodeConfig, PeerTable};

#[derive(Parser)]
#[command(name = "zerocloud", version, about = "Serverless LAN chat and file drop")]
struct Cli {
    /// Also write logs to a daily-rolling file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Shared passphrase for message bodies
    #[arg(long, global = true, default_value = DEFAULT_PASSPHRASE)]
    passphrase: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Announce this host, track peers and receive messages and files
    Listen(ListenArgs),
    /// Send one message to IP or IP:PORT
    Send {
        #[arg(long)]
        to: String,
        #[arg(long)]
        from: Option<String>,
        message: String,
    },
    /// Upload one file to IP or IP:PORT
    Upload {
        #[arg(long)]
        to: String,
        #[arg(long)]
        sender: Option<String>,
        file: PathBuf,
    },
    /// Ask a host for its identity via its info endpoint
    Resolve {
        ip: IpAddr,
        #[arg(long, default_value_t = DEFAULT_TRANSPORT_PORT)]
        port: u16,
    },
}

#[derive(Args)]
struct ListenArgs {
    /// Identity announced to peers (defaults to the hostname)
    #[arg(long)]
    name: Option<String>,
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,
    #[arg(long, default_value_t = DEFAULT_TRANSPORT_PORT)]
    port: u16,
    #[arg(long)]
    download_dir: Option<PathBuf>,
    /// Skip multicast discovery; use --peer or the `resolve` command instead
    #[arg(long)]
    no_discovery: bool,
    /// Hosts to resolve by address at startup
    #[arg(long = "peer")]
    peers: Vec<IpAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = zerocloud_lib::logging::init(cli.log_dir.as_deref());
    let cipher = Cipher::from_passphrase(&cli.passphrase);

    match cli.command {
        Command::Listen(args) => listen(args, cipher).await,
        Command::Send { to, from, message } => {
            let (ip, port) = parse_target(&to)?;
            let message = ChatMessage {
                from: from.unwrap_or_else(config::system_hostname),
                message: cipher.seal(&message)?,
            };
            MessageSender::new(Duration::from_secs(5))?
                .send_message(ip, port, &message)
                .await?;
            println!("Message delivered to {}:{}", ip, port);
            Ok(())
        }
        Command::Upload { to, sender, file } => {
            let (ip, port) = parse_target(&to)?;
            let sender = sender.unwrap_or_else(config::system_hostname);
            MessageSender::new(Duration::from_secs(5))?
                .upload_file(ip, port, &file, &sender)
                .await?;
            println!("Uploaded {} to {}:{}", file.display(), ip, port);
            Ok(())
        }
        Command::Resolve { ip, port } => {
            let (events, _rx) = EventSink::channel();
            let table = PeerTable::new(config::system_hostname());
            let resolver =
                Resolver::new(SERVICE_NAME, port, Duration::from_secs(5), table, events)?;
            let peer = resolver.resolve(ip).await?;
            println!("{} is {} ({}:{})", ip, peer.identity, peer.ip, peer.port);
            Ok(())
        }
    }
}

async fn listen(args: ListenArgs, cipher: Cipher) -> Result<()> {
    let mut config = NodeConfig {
        bind_address: args.bind,
        port: args.port,
        ..NodeConfig::default()
    };
    if let Some(name) = args.name {
        config.identity = name;
    }
    if let Some(dir) = args.download_dir {
        config.download_dir = dir;
    }
    config.discovery.enabled = !args.no_discovery;

    let (node, mut events) = Node::start(config).await.context("starting node")?;
    for ip in args.peers {
        if let Err(e) = node.resolve(ip).await {
            tracing::warn!("{}", e);
        }
    }

    println!("Commands: peers | send <peer> <text> | upload <peer> <path>");
    println!("          resolve <ip> | rebind <ip> <port>");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => show(event, &cipher),
                None => break,
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Err(e) = command(&node, &cipher, line.trim()).await {
                        tracing::warn!("{:#}", e);
                    }
                }
                // stdin closed: keep serving until Ctrl-C
                Ok(None) => stdin_open = false,
                Err(e) => bail!("reading stdin: {}", e),
            },
        }
    }

    node.shutdown().await;
    Ok(())
}

async fn command(node: &Node, cipher: &Cipher, line: &str) -> Result<()> {
    let mut parts = line.splitn(3, ' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("peers"), _, _) => {
            for p in node.peers() {
                println!("  {} {}:{}", p.identity, p.ip, p.port);
            }
        }
        (Some("send"), Some(peer), Some(text)) => {
            node.send_message(peer, &cipher.seal(text)?).await?;
        }
        (Some("upload"), Some(peer), Some(path)) => {
            node.upload_file(peer, Path::new(path)).await?;
        }
        (Some("resolve"), Some(ip), _) => {
            let peer = node.resolve(ip.parse::<IpAddr>()?).await?;
            println!("Added {} at {}:{}", peer.identity, peer.ip, peer.port);
        }
        (Some("rebind"), Some(ip), Some(port)) => {
            let bound = node
                .rebind(ip.parse::<IpAddr>()?, port.trim().parse::<u16>()?)
                .await?;
            println!("Now listening on {}", bound);
        }
        (Some(""), _, _) | (None, _, _) => {}
        _ => bail!("unrecognised command: {}", line),
    }
    Ok(())
}

fn show(event: Event, cipher: &Cipher) {
    match event {
        Event::PeersUpdated(peers) => {
            let names: Vec<_> = peers.iter().map(|p| p.identity.as_str()).collect();
            if names.is_empty() {
                println!("Peers: (none)");
            } else {
                println!("Peers: {}", names.join(", "));
            }
        }
        Event::FileReceived {
            filename,
            sender,
            path,
        } => {
            println!("File {} from {} saved to {}", filename, sender, path.display());
        }
        Event::MessageReceived { payload, .. } => {
            println!("{}: {}", payload.from, cipher.open_or_placeholder(&payload.message));
        }
        Event::MyInfo {
            identity,
            address,
            port,
        } => {
            println!("This is {} at {}:{}", identity, address, port);
        }
    }
}

/// Accepts `IP:PORT` or a bare `IP` (default transport port).
fn parse_target(target: &str) -> Result<(IpAddr, u16)> {
    if let Ok(sock) = target.parse::<SocketAddr>() {
        return Ok((sock.ip(), sock.port()));
    }
    match target.parse::<IpAddr>() {
        Ok(ip) => Ok((ip, DEFAULT_TRANSPORT_PORT)),
        Err(_) => bail!("Invalid IP address or format (use IP or IP:PORT): {}", target),
    }
}
