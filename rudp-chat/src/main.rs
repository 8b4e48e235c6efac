use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use rudp_protocol::AppMessage;
use rudp_protocol::IpMode;
use rudp_protocol::RudpClient;
use rudp_protocol::RudpConnection;
use rudp_protocol::RudpError;
use rudp_protocol::RudpServer;
use std::net::SocketAddr;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::mpsc::UnboundedSender;
use tracing_subscriber::EnvFilter;

/// rudpchat - line-oriented chat over the reliable UDP transport
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    role: Role,

    /// Verbosity level (up to -vvv)
    #[arg(short, long, default_value_t = 0, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Accept connections and broadcast stdin lines to every client
    Server {
        /// Bind address (ip:port)
        #[arg(short, long, default_value = "0.0.0.0:4242")]
        bind: SocketAddr,
    },
    /// Connect to a server and send stdin lines
    Client {
        /// Server host name or address
        #[arg(short, long, default_value = "127.0.0.1")]
        target: String,

        /// Server port
        #[arg(short, long, default_value_t = 4242)]
        port: u16,

        /// Resolve IPv4 addresses only
        #[arg(long, conflicts_with = "ipv6_only")]
        ipv4_only: bool,

        /// Resolve IPv6 addresses only
        #[arg(long)]
        ipv6_only: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // tokio::main makes rust-analyzer fragile,
    // so put the code in a separate place.
    real_main().await
}

async fn real_main() -> Result<()> {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match args.role {
        Role::Server { bind } => run_server(bind).await,
        Role::Client {
            target,
            port,
            ipv4_only,
            ipv6_only,
        } => {
            let mode = if ipv4_only {
                IpMode::V4Only
            } else if ipv6_only {
                IpMode::V6Only
            } else {
                IpMode::Any
            };
            run_client(&target, port, mode).await
        }
    }
}

enum ServerInput {
    Conn(Result<RudpConnection, RudpError>),
    Line(Option<String>),
    Quit,
}

async fn run_server(bind: SocketAddr) -> Result<()> {
    let mut server = RudpServer::bind(bind).await?;
    println!("listening on {}", server.local_addr());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    // A peer sending "quit" stops the whole server.
    let (quit_tx, mut quit_rx) = unbounded_channel();

    loop {
        let input = tokio::select! {
            conn = server.accept() => ServerInput::Conn(conn),
            line = lines.next_line() => ServerInput::Line(line?),
            _ = quit_rx.recv() => ServerInput::Quit,
        };
        match input {
            ServerInput::Conn(conn) => {
                let conn = conn?;
                println!("peer {} connected", conn.remote_addr());
                tokio::spawn(print_peer_messages(conn, quit_tx.clone()));
            }
            ServerInput::Line(None) => break,
            // Typed lines are broadcast as-is, "quit" included.
            ServerInput::Line(Some(line)) => server.send_all(true, 0, line.as_bytes())?,
            ServerInput::Quit => break,
        }
    }
    Ok(())
}

async fn print_peer_messages(mut conn: RudpConnection, quit: UnboundedSender<()>) {
    let remote = conn.remote_addr();
    loop {
        match conn.recv().await {
            Ok(msg) => {
                let quit_requested = msg.payload.starts_with(b"quit");
                print_message(&format!("{}", remote), &msg);
                if quit_requested {
                    let _ = quit.send(());
                    return;
                }
            }
            Err(err) => {
                println!("peer {} gone: {}", remote, err);
                return;
            }
        }
    }
}

enum ClientInput {
    Msg(Result<AppMessage, RudpError>),
    Line(Option<String>),
}

async fn run_client(host: &str, port: u16, mode: IpMode) -> Result<()> {
    let mut client = RudpClient::connect_host(host, port, mode).await?;
    println!("connected to {}", client.remote_addr());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let input = tokio::select! {
            msg = client.recv() => ClientInput::Msg(msg),
            line = lines.next_line() => ClientInput::Line(line?),
        };
        match input {
            ClientInput::Msg(msg) => {
                let msg = msg?;
                let quit = msg.payload.starts_with(b"quit");
                print_message("server", &msg);
                if quit {
                    break;
                }
            }
            ClientInput::Line(None) => break,
            ClientInput::Line(Some(line)) => client.send(true, 0, line.as_bytes())?,
        }
    }
    client.close();
    Ok(())
}

fn print_message(from: &str, msg: &AppMessage) {
    println!(
        ">>> [{}] command {}, message '''{}'''",
        from,
        msg.command,
        String::from_utf8_lossy(&msg.payload)
    );
}
