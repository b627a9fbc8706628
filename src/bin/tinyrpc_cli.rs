use std::{
    error::Error,
    io::{self, Write},
    path::PathBuf,
    thread,
};

use chrono::Local;
use clap::Parser;
use tinyrpc::{
    Client, ClientConfig, ClientError, Command,
    cli::{HELP, PromptError, ask},
    logging, prompt,
};

const PING_VALUE: u64 = 0x1010101010101010;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Server host name or address
    #[arg(long)]
    host: Option<String>,
    /// Server port
    #[arg(short, long)]
    port: Option<u16>,
    /// Concurrent calls issued per request
    #[arg(short, long, default_value_t = 1)]
    threads: usize,
}

/// Issues `call` on `threads` threads at once and prints each outcome.
fn run<F>(threads: usize, call: F)
where
    F: Fn() -> Result<String, ClientError> + Sync,
{
    thread::scope(|s| {
        let handles: Vec<_> = (0..threads).map(|_| s.spawn(&call)).collect();

        for handle in handles {
            match handle.join() {
                Ok(Ok(reply)) => println!("received: {reply}"),
                Ok(Err(e)) => println!("Error occurred: {e}"),
                Err(_) => println!("Error occurred: client thread panicked"),
            }
        }
    });
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    logging::init(&config.log_level)?;

    let client = Client::new(config);
    let mut threads = cli.threads.max(1);
    let stdin = io::stdin();
    let stdout = io::stdout();

    println!("{HELP}");
    loop {
        let cmd = match prompt(stdin.lock(), stdout.lock()) {
            Ok(cmd) => cmd,
            Err(PromptError::Closed) => break,
            Err(e @ PromptError::Unrecognized(_)) => {
                eprintln!("{e}");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        match cmd {
            Command::Quit => break,
            Command::Help => println!("{HELP}"),
            Command::Threads => {
                let input = ask(stdin.lock(), stdout.lock(), "threads: ")?;
                match input.trim().parse::<usize>() {
                    Ok(n) if n > 0 => threads = n,
                    _ => eprintln!("invalid thread count '{input}'"),
                }
            }
            Command::Echo => {
                let text = ask(stdin.lock(), stdout.lock(), "message: ")?;
                run(threads, || client.sendmsg(&text));
            }
            Command::Time => run(threads, || {
                let time = client.gettime()?.with_timezone(&Local);
                Ok(time.format("%Y-%m-%d %X").to_string())
            }),
            Command::Exec => {
                let command = ask(stdin.lock(), stdout.lock(), "command: ")?;
                run(threads, || client.execmd(&command));
            }
            Command::Calculate => {
                let expression = ask(stdin.lock(), stdout.lock(), "expression: ")?;
                run(threads, || client.calculate(&expression));
            }
            Command::Ping => run(threads, || match client.ping(PING_VALUE)? {
                PING_VALUE => Ok(format!("{PING_VALUE:#x}")),
                other => Err(ClientError::InvalidReply(format!(
                    "ping returned {other:#x}, sent {PING_VALUE:#x}"
                ))),
            }),
            Command::Credentials => {
                let login = ask(stdin.lock(), stdout.lock(), "login (empty for configured): ")?;
                if login.is_empty() {
                    run(threads, || {
                        client
                            .authenticate()
                            .map(|_| "credentials accepted".to_string())
                    });
                    continue;
                }

                let password = ask(stdin.lock(), stdout.lock(), "password: ")?;
                run(threads, || {
                    client
                        .check_credentials(&login, &password)
                        .map(|_| "credentials accepted".to_string())
                });
            }
        }
        io::stdout().flush()?;
    }

    Ok(())
}
