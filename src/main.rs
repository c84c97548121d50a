use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use exiting::{
    BoxError, ExitingConfig, ExtHandler, ExtPoint, ListenerHandle, Manager, ManagerOptions,
    Server, ServerSet, StopOptions,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "exiting-demo")]
#[command(about = "TCP echo servers that shut down gracefully on signals and exit requests")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "exiting.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Number of echo servers to run
    #[arg(short = 'n', long, default_value_t = 2)]
    servers: u16,

    /// Port of the first server; the others use the following ports
    #[arg(short, long, default_value_t = 7000)]
    port: u16,

    /// Request a graceful exit after this many seconds
    #[arg(long, value_name = "SECONDS")]
    exit_after: Option<u64>,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Log output format
    #[arg(long, value_enum, value_name = "FORMAT", default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    Pretty,
    Json,
    Compact,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting exiting-demo v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = ExitingConfig::load_from_file(&args.config).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    config.validate()?;

    let servers: Vec<Arc<dyn Server>> = (0..args.servers)
        .map(|i| {
            let addr = SocketAddr::from(([127, 0, 0, 1], args.port.saturating_add(i)));
            Arc::new(EchoServer::new(format!("echo-{}", i), addr)) as Arc<dyn Server>
        })
        .collect();

    let manager = Manager::new(ServerSet::new(servers), ManagerOptions::from(&config))?;

    if let Err(e) = manager.start().await {
        if !e.is_escape() {
            error!("Failed to start servers: {}", e);
            manager.before_exit();
            return Err(e.into());
        }
    }

    if let Some(secs) = args.exit_after {
        tokio::time::sleep(Duration::from_secs(secs)).await;
        info!("Requesting exit after {}s", secs);
        let escape = exiting::exit(0);
        debug!("Exit path running for code {}", escape.code());
    }

    // The manager terminates the process once the servers have stopped
    std::future::pending::<()>().await;
    Ok(())
}

/// TCP echo server driven by the manager
struct EchoServer {
    name: String,
    addr: SocketAddr,
    listener: ListenerHandle,
    shutdown: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    pre_stop: Mutex<Vec<ExtHandler>>,
}

impl EchoServer {
    fn new(name: String, addr: SocketAddr) -> Self {
        Self {
            name,
            addr,
            listener: ListenerHandle::new(),
            shutdown: CancellationToken::new(),
            accept_task: Mutex::new(None),
            pre_stop: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Server for EchoServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), BoxError> {
        let socket = TcpListener::bind(self.addr).await?;
        info!("{} listening on {}", self.name, self.addr);

        let listener = self.listener.clone();
        let shutdown = self.shutdown.clone();
        let name = self.name.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = socket.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("{} accepted {}", name, peer);
                            tokio::spawn(echo(stream, shutdown.clone()));
                        }
                        Err(e) => {
                            warn!("{} accept failed: {}", name, e);
                            break;
                        }
                    }
                }
            }
            listener.close();
        });

        *self.accept_task.lock() = Some(task);
        Ok(())
    }

    async fn stop(&self, options: StopOptions) -> Result<(), BoxError> {
        let handlers = self.pre_stop.lock().clone();
        for handler in handlers {
            handler().await?;
        }

        self.shutdown.cancel();
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(options.timeout, task).await.is_err() {
                warn!("{} did not stop within {:?}", self.name, options.timeout);
            }
        }

        info!("{} stopped", self.name);
        Ok(())
    }

    fn ext(&self, point: ExtPoint, handler: ExtHandler) {
        match point {
            ExtPoint::PreStop => self.pre_stop.lock().push(handler),
        }
    }

    fn listener(&self) -> ListenerHandle {
        self.listener.clone()
    }
}

async fn echo(mut stream: TcpStream, shutdown: CancellationToken) {
    let (mut reader, mut writer) = stream.split();
    tokio::select! {
        _ = shutdown.cancelled() => {}
        result = tokio::io::copy(&mut reader, &mut writer) => {
            if let Err(e) = result {
                debug!("Echo connection ended: {}", e);
            }
        }
    }
    let _ = writer.shutdown().await;
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    // Determine log level based on flags
    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("exiting={},exiting_demo={}", log_level, log_level))
    });

    let fmt_layer = match args.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    println!("# exiting-demo configuration file");
    println!("# Every key can be overridden with an EXITING_<KEY> environment variable");
    println!();
    println!("{}", toml::to_string_pretty(&ExitingConfig::default())?);
    Ok(())
}
