use std::net::{Ipv6Addr, SocketAddrV6};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpStream;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use tmmp::config::{Config, Providers};
use tmmp::error::{Error, Result};
use tmmp::pcap::{PacketWriter, PcapSink, run_flush_task};
use tmmp::stream::TcpByteStream;
use tmmp::tunnel::Tunnel;

const LONG_ABOUT: &str = "\
TLS Man-in-the-Middle Proxy (TMMP)

The proxy is configured with a configuration file in the TOML format.
Get an example configuration with `tmmp --example'.

Configurable options are:

-- Section \"server\"
listen: IPv6(!) address to listen on. To listen on IPv4, use ::ffff:ipv4
        (default \"::\" = all interfaces, dualstack).
port:   Port to listen on (default 1234).

-- Section \"proxy\"
protocol:       Which proxy protocol to use: socks, http or simple
                (default \"socks\").
protocol_class: Alternative protocol registry name; accepts the same
                names as protocol.
remote:         Fixed host:port destination, required by \"simple\".

-- Section \"application\"
max_depth: How many nested protocol upgrades (e.g. TLS in TLS) are
           allowed (default 1).
protocols: List of application protocols by name (default [ \"tls\" ]).
protocols_class: Alternative registry names (default not set).

-- Section \"tls\"
ciphers: Cipher suites allowed on the listening side: \"ALL\" or a
         colon-separated list of rustls suite names (default \"ALL\",
         this is intentionally permissive).

-- Section \"providers\"
certificates:  Only \"selfsigned\" is implemented (\"ca\" is reserved).
selfsigned_cn: Issuer common name on minted certificates
               (default \"TLS Breaker Proxy\").

Decrypted traffic is written as a synthetic TCP stream to
pcap/<unix_time>.pcap in the working directory.";

#[derive(Parser)]
#[command(name = "tmmp", version, about = "TLS man-in-the-middle proxy", long_about = LONG_ABOUT)]
struct Cli {
    /// Print an example configuration file and exit.
    #[arg(short, long)]
    example: bool,

    /// Path to the TOML configuration file.
    config_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.example {
        print!("{}", Config::EXAMPLE);
        return ExitCode::SUCCESS;
    }
    let Some(path) = cli.config_file else {
        eprintln!("usage: tmmp (--help | --example | config_file)");
        return ExitCode::FAILURE;
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // One event loop; tunnels are multiplexed cooperatively on it.
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start the event loop: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let providers = Providers::from_config(&config)?;

    let sink = Arc::new(PcapSink::new());
    tokio::spawn(run_flush_task(sink.clone(), PathBuf::from("pcap")));

    let listener = bind_listener(&config)?;
    info!(
        "listening on [{}]:{}",
        config.server.listen, config.server.port
    );

    loop {
        let (connection, peer) = listener.accept().await?;
        debug!(%peer, "accepted connection");

        let providers = providers.clone();
        let sink = sink.clone();
        let max_depth = config.application.max_depth;
        tokio::spawn(async move {
            if let Err(e) = handle_connection(connection, providers, sink, max_depth).await {
                debug!("connection ended: {e}");
            }
        });
    }
}

async fn handle_connection(
    mut connection: TcpStream,
    providers: Providers,
    sink: Arc<PcapSink>,
    max_depth: u32,
) -> Result<()> {
    let Some((target, upstream)) = providers.proxy.handshake(&mut connection).await? else {
        // Rejected; the protocol already answered the client.
        return Ok(());
    };
    info!(%target, "tunnel established");

    let writer = PacketWriter::new(connection.peer_addr()?, upstream.peer_addr()?, sink);
    let tunnel = Tunnel::new(
        Box::new(TcpByteStream::new(connection)),
        Box::new(TcpByteStream::new(upstream)),
        providers.application_protocols.clone(),
        max_depth,
        writer,
    );
    tunnel.schedule();
    Ok(())
}

fn bind_listener(config: &Config) -> Result<tokio::net::TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let listen: Ipv6Addr = config.server.listen.parse().map_err(|_| {
        Error::Config(format!(
            "server.listen is not an IPv6 address: {}",
            config.server.listen
        ))
    })?;

    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_only_v6(false)?;
    socket.bind(&SocketAddrV6::new(listen, config.server.port, 0, 0).into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;

    tokio::net::TcpListener::from_std(socket.into()).map_err(Error::Transport)
}
