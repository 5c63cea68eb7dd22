//! Conduit Server - session router for local foreground clients.
//!
//! Listens on a per-user Unix socket and routes each client connection to the
//! backend it names in its `init` message. Runs until a client sends `quit` or
//! the process receives Ctrl-C.

use anyhow::Result;
use clap::Parser;
use conduit_core::IpcConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "conduit")]
#[command(about = "Session-routing IPC server for local clients")]
struct Args {
    /// Base directory for the socket (defaults to the user runtime directory)
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Namespace segment of the socket path
    #[arg(long, default_value = "Conduit")]
    namespace: String,

    /// Endpoint name, shared by clients and the quit control message
    #[arg(long, default_value = "Launcher")]
    endpoint: String,

    /// Take over the endpoint from a running server
    #[arg(long)]
    replace: bool,

    /// Ask a running server to shut down, then exit
    #[arg(long)]
    quit: bool,

    /// Register an echo backend under this id (repeatable)
    #[arg(long = "echo-backend", value_name = "ID")]
    echo_backends: Vec<String>,

    /// Backend call timeout in milliseconds (0 = wait forever)
    #[arg(long, default_value = "10000")]
    backend_timeout_ms: u64,

    /// Largest message accepted from or sent to a client, in bytes
    #[arg(long, default_value_t = IpcConfig::MAX_MESSAGE_SIZE)]
    max_message_size: usize,

    /// Answer rejected messages with a JSON error instead of staying silent
    #[arg(long)]
    error_replies: bool,

    /// Allow members of the owning group to connect
    #[arg(long)]
    group_access: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_logging(args: &Args) {
    use tracing_subscriber::EnvFilter;

    let default_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);

    if args.log_json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[cfg(unix)]
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);
    run(args).await
}

#[cfg(unix)]
async fn run(args: Args) -> Result<()> {
    use conduit_core::ipc::EndpointAddress;
    use conduit_core::{
        EchoBackend, IpcClient, IpcServer, PermissionPolicy, ServerOptions, StaticRegistry,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tracing::{info, warn};

    let mut options = ServerOptions::default()
        .namespace(args.namespace)
        .endpoint(args.endpoint)
        .replace_existing(args.replace)
        .error_replies(args.error_replies)
        .max_message_size(args.max_message_size)
        .backend_timeout(match args.backend_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        });
    if let Some(dir) = args.socket_dir {
        options = options.socket_dir(dir);
    }
    if args.group_access {
        options = options.policy(Arc::new(PermissionPolicy::group_shared()));
    }

    if args.quit {
        let address = EndpointAddress::from_options(&options)?;
        let path = address.path();
        IpcClient::request_quit(&path).await?;
        info!("Sent quit to {}", path.display());
        return Ok(());
    }

    let registry = StaticRegistry::new();
    for id in &args.echo_backends {
        registry.register(id.clone(), Arc::new(EchoBackend::new(id.clone())));
    }
    if registry.is_empty() {
        warn!("No backends registered; every init will be rejected");
    }

    info!("Starting Conduit server");
    let mut server = IpcServer::start(options, Arc::new(registry)).await?;

    // Print the socket path for launchers to read (intentional stdout)
    println!("CONDUIT_SOCKET={}", server.path().display());

    let finished = tokio::select! {
        result = server.wait() => Some(result?),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            None
        }
    };

    let reason = match finished {
        Some(reason) => reason,
        None => {
            info!("Shutdown signal received");
            server.shutdown();
            server.wait().await?
        }
    };

    info!("Conduit server stopped: {:?}", reason);
    Ok(())
}

#[cfg(not(unix))]
fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);
    anyhow::bail!("conduit requires Unix domain sockets on this platform")
}
