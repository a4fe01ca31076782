//! Echo over rpcbinder - Demo Binary
//!
//! One process serves an echo object as its root, another calls it.
//!
//! # Usage
//!
//! ```bash
//! echo-over-rpcbinder serve --unix /tmp/echo.sock --threads 4
//! echo-over-rpcbinder call --unix /tmp/echo.sock --message hello --count 3
//!
//! # TCP, message-channel transports need a unix socket
//! echo-over-rpcbinder serve --tcp 127.0.0.1:4100
//! echo-over-rpcbinder call --tcp 127.0.0.1:4100
//! ```
//!
//! Set `RUST_LOG=rpcbinder=debug` to watch sessions come and go.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{Args, Parser, Subcommand, ValueEnum};
use rpcbinder::{
    Binder, CallContext, Payload, Server, Session, StatusCode, ThreadingMode, TransactionFlags,
    TransportFactory,
};

const ECHO: u32 = 1;

#[derive(Parser, Debug)]
#[command(name = "echo-over-rpcbinder")]
#[command(about = "Echo server and client over rpcbinder")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve an echo object until interrupted
    Serve {
        #[command(flatten)]
        endpoint: Endpoint,
        /// Threads offered to each session
        #[arg(long, default_value_t = 1)]
        threads: usize,
        /// Run every connection on the accepting thread
        #[arg(long)]
        cooperative: bool,
    },
    /// Call the echo object a few times and report round-trip times
    Call {
        #[command(flatten)]
        endpoint: Endpoint,
        #[arg(long, default_value = "hello")]
        message: String,
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
}

#[derive(Args, Debug)]
struct Endpoint {
    /// Unix socket path
    #[arg(long, conflicts_with = "tcp", required_unless_present = "tcp")]
    unix: Option<PathBuf>,
    /// host:port to listen on or connect to
    #[arg(long)]
    tcp: Option<String>,
    #[arg(long, value_enum, default_value_t = TransportKind::Raw)]
    transport: TransportKind,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TransportKind {
    Raw,
    Channel,
}

impl Endpoint {
    fn factory(&self) -> TransportFactory {
        match self.transport {
            TransportKind::Raw => TransportFactory::raw(),
            TransportKind::Channel => TransportFactory::channel(),
        }
    }

    fn tcp(&self) -> rpcbinder::Result<Option<(String, u16)>> {
        let Some(addr) = &self.tcp else {
            return Ok(None);
        };
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| rpcbinder::RpcError::BadValue(format!("{addr} is not host:port")))?;
        let port = port
            .parse()
            .map_err(|_| rpcbinder::RpcError::BadValue(format!("bad port in {addr}")))?;
        Ok(Some((host.to_string(), port)))
    }
}

struct Echo;

impl Binder for Echo {
    fn on_transact(
        &self,
        ctx: &CallContext<'_>,
        code: u32,
        data: Payload,
    ) -> Result<Payload, StatusCode> {
        match code {
            ECHO => {
                tracing::info!(
                    session = ?ctx.session().and_then(|s| s.id()),
                    len = data.data.len(),
                    "echo"
                );
                Ok(data)
            }
            _ => Err(StatusCode::UnknownTransaction),
        }
    }

    fn descriptor(&self) -> &str {
        "demo.Echo"
    }
}

fn serve(endpoint: &Endpoint, threads: usize, cooperative: bool) -> rpcbinder::Result<()> {
    let server = Server::new(&endpoint.factory())?;
    server.set_max_threads(threads)?;
    if cooperative {
        server.set_threading_mode(ThreadingMode::Cooperative)?;
    }
    server.set_root_object(Arc::new(Echo));

    match (&endpoint.unix, endpoint.tcp()?) {
        (Some(path), _) => {
            // a stale socket from an earlier run would make bind fail
            let _ = std::fs::remove_file(path);
            server.setup_unix_domain_server(path)?;
            println!("listening on {}", path.display());
        }
        (None, Some((host, port))) => {
            let port = server.setup_inet_server(&host, port)?;
            println!("listening on {host}:{port}");
        }
        (None, None) => unreachable!("clap requires an endpoint"),
    }

    server.join()
}

fn call(endpoint: &Endpoint, message: &str, count: usize) -> rpcbinder::Result<()> {
    let session = Session::new(&endpoint.factory())?;
    match (&endpoint.unix, endpoint.tcp()?) {
        (Some(path), _) => session.setup_unix_domain_client(path)?,
        (None, Some((host, port))) => session.setup_inet_client(&host, port)?,
        (None, None) => unreachable!("clap requires an endpoint"),
    }
    println!(
        "session {} ({} server threads)",
        session.id().map(|id| id.to_string()).unwrap_or_default(),
        session.get_remote_max_threads()?
    );

    let Some(root) = session.get_root_object()? else {
        eprintln!("server has no root object");
        session.shutdown_and_wait(true);
        return Ok(());
    };

    for i in 0..count {
        let started = Instant::now();
        let reply = root.transact(
            ECHO,
            Payload::new(message.as_bytes().to_vec()),
            TransactionFlags::empty(),
        )?;
        println!(
            "[{i}] {:?} in {:?}",
            String::from_utf8_lossy(&reply.data),
            started.elapsed()
        );
    }

    drop(root);
    session.shutdown_and_wait(true);
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let result = match &cli.command {
        Command::Serve {
            endpoint,
            threads,
            cooperative,
        } => serve(endpoint, *threads, *cooperative),
        Command::Call {
            endpoint,
            message,
            count,
        } => call(endpoint, message, *count),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
