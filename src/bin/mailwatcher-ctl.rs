//! `mailwatcher-ctl`: the control client
//!
//! `--list`/`--add`/`--delete` talk to the SQLite mailbox store directly;
//! they work even if the daemon isn't running, matching the original's
//! direct-repository access for those paths. `--msg <Action>` connects to
//! the running daemon's control socket, sends the corresponding
//! `ControlMessage`, and (for `Watch`/`WatchAll`) prints `Code`/
//! `ConnectionError` events as they arrive until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use mailwatcher::config::{Config, DEFAULT_SOCKET_PATH};
use mailwatcher::mailbox::{Mailbox, MailboxStore, SqliteMailboxStore};
use mailwatcher::protocol::{self, ControlMessage};
use secrecy::SecretString;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(name = "mailwatcher-ctl", about = "Manage mailboxes and drive the mailwatcher daemon")]
struct Cli {
    /// List every registered mailbox.
    #[arg(long)]
    list: bool,
    /// Register a new mailbox (requires --email/--password/--server/--port).
    #[arg(long)]
    add: bool,
    /// Remove a mailbox (requires --email).
    #[arg(long)]
    delete: bool,
    /// Send a control message to the running daemon.
    #[arg(long, value_enum)]
    msg: Option<Msg>,

    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    server: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    with_tls: bool,

    /// Overrides the config's `database` path (only used by --list/--add/--delete).
    #[arg(long)]
    db: Option<String>,
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "./config.yaml")]
    config: PathBuf,
    /// Overrides the config's `socket_path` (only used by --msg).
    #[arg(long)]
    socket: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Msg {
    Watch,
    WatchAll,
    Stop,
    StopAll,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.list || cli.add || cli.delete {
        return run_store_command(&cli);
    }

    if let Some(msg) = cli.msg {
        return run_socket_command(&cli, msg).await;
    }

    eprintln!("nothing to do: pass --list, --add, --delete, or --msg <Action>");
    ExitCode::FAILURE
}

fn open_store(cli: &Cli) -> Result<Box<dyn MailboxStore>, ExitCode> {
    let database = match &cli.db {
        Some(db) => db.clone(),
        None => match Config::load(&cli.config) {
            Ok(config) => config.database,
            Err(err) => {
                eprintln!("failed to load config: {err}");
                return Err(ExitCode::FAILURE);
            }
        },
    };

    SqliteMailboxStore::open(&database)
        .map(|store| Box::new(store) as Box<dyn MailboxStore>)
        .map_err(|err| {
            eprintln!("failed to open mailbox store at {database}: {err}");
            ExitCode::FAILURE
        })
}

fn run_store_command(cli: &Cli) -> ExitCode {
    let store = match open_store(cli) {
        Ok(store) => store,
        Err(code) => return code,
    };

    if cli.list {
        return match store.get_all() {
            Ok(mailboxes) => {
                for mailbox in mailboxes {
                    println!(
                        "{}\t{}:{}\ttls={}",
                        mailbox.email, mailbox.server, mailbox.port, mailbox.use_tls
                    );
                }
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("failed to list mailboxes: {err}");
                ExitCode::FAILURE
            }
        };
    }

    if cli.add {
        let (Some(email), Some(password), Some(server), Some(port)) =
            (&cli.email, &cli.password, &cli.server, cli.port)
        else {
            eprintln!("--add requires --email, --password, --server and --port");
            return ExitCode::FAILURE;
        };

        let mailbox = Mailbox {
            email: email.clone(),
            password: SecretString::new(password.clone().into()),
            server: server.clone(),
            port,
            use_tls: cli.with_tls,
        };

        return match store.add(mailbox) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("failed to add mailbox: {err}");
                ExitCode::FAILURE
            }
        };
    }

    if cli.delete {
        let Some(email) = &cli.email else {
            eprintln!("--delete requires --email");
            return ExitCode::FAILURE;
        };

        return match store.remove(email) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("failed to remove mailbox: {err}");
                ExitCode::FAILURE
            }
        };
    }

    ExitCode::SUCCESS
}

async fn run_socket_command(cli: &Cli, msg: Msg) -> ExitCode {
    let socket_path = match &cli.socket {
        Some(path) => path.clone(),
        None => match Config::load(&cli.config) {
            Ok(config) => config.socket_path,
            Err(_) => DEFAULT_SOCKET_PATH.to_owned(),
        },
    };

    let stream = match UnixStream::connect(&socket_path).await {
        Ok(stream) => stream,
        Err(err) => {
            eprintln!("failed to connect to daemon at {socket_path}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let (read_half, mut write_half) = tokio::io::split(stream);

    let message = match (msg, &cli.email) {
        (Msg::Watch, Some(email)) => ControlMessage::Watch {
            email: email.clone(),
        },
        (Msg::Watch, None) => {
            eprintln!("--msg Watch requires --email");
            return ExitCode::FAILURE;
        }
        (Msg::WatchAll, _) => ControlMessage::WatchAll,
        (Msg::Stop, Some(email)) => ControlMessage::Stop {
            email: email.clone(),
        },
        (Msg::Stop, None) => {
            eprintln!("--msg Stop requires --email");
            return ExitCode::FAILURE;
        }
        (Msg::StopAll, _) => ControlMessage::StopAll,
    };

    let line = protocol::encode(&message);
    if let Err(err) = write_half.write_all(format!("{line}\n").as_bytes()).await {
        eprintln!("failed to send control message: {err}");
        return ExitCode::FAILURE;
    }

    println!("sent, listening for events (Ctrl+C to stop)...");
    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => match protocol::decode(&line) {
                        Ok(ControlMessage::Code { code, sender }) => {
                            println!("code={code} sender={sender}");
                        }
                        Ok(ControlMessage::ConnectionError { email, error }) => {
                            println!("connection error: email={email} error={error}");
                        }
                        Ok(_) => {}
                        Err(err) => eprintln!("malformed event: {err}"),
                    },
                    Ok(None) => {
                        eprintln!("daemon closed the connection");
                        return ExitCode::SUCCESS;
                    }
                    Err(err) => {
                        eprintln!("read error: {err}");
                        return ExitCode::FAILURE;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                return ExitCode::SUCCESS;
            }
        }
    }
}
