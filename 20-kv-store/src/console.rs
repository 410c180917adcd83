//! Line-oriented front end for the `client` subcommand.
//!
//! [`ConsoleCommand::parse`] turns one input line into a command and
//! [`run_console`] executes commands through a [`Client`], printing one result
//! line each. `WHEN` does not block the prompt: its result is printed whenever
//! it arrives.

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    select,
    sync::mpsc,
};
use tracing::warn;

use crate::{
    cli::ClientArgs,
    client::{Client, GetWhenCallback},
    error::Error,
};

const USAGE: &str = "commands: REGISTER/r <user> <password>, LOGIN/l <user> <password>, \
PUT/p <key> <value>, GET/g <key>, MPUT <k1> <v1> [<k2> <v2> ...], MGET <k1> [<k2> ...], \
WHEN/w <key> <condKey> <condValue>, LOGOUT/o, HELP/h, EXIT/e";

#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Register { username: String, password: String },
    Login { username: String, password: String },
    Put { key: String, value: String },
    Get { key: String },
    MultiPut { pairs: Vec<(String, String)> },
    MultiGet { keys: Vec<String> },
    When {
        key: String,
        cond_key: String,
        cond_value: String,
    },
    Logout,
    Help,
    Exit,
}

impl ConsoleCommand {
    /// Parses a line of user input. The command word is case-insensitive and
    /// most commands have a one-letter alias; arguments are taken verbatim.
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((first, args)) = parts.split_first() else {
            return Err(anyhow!("empty command"));
        };

        let cmd = first.to_uppercase();
        let normalized_cmd = match cmd.as_str() {
            "R" => "REGISTER",
            "L" => "LOGIN",
            "P" => "PUT",
            "G" => "GET",
            "W" => "WHEN",
            "O" => "LOGOUT",
            "H" => "HELP",
            "E" => "EXIT",
            other => other,
        };
        let owned = |i: usize| args[i].to_string();

        match (normalized_cmd, args.len()) {
            ("EXIT", 0) => Ok(ConsoleCommand::Exit),
            ("HELP", 0) => Ok(ConsoleCommand::Help),
            ("LOGOUT", 0) => Ok(ConsoleCommand::Logout),
            ("REGISTER", 2) => Ok(ConsoleCommand::Register {
                username: owned(0),
                password: owned(1),
            }),
            ("LOGIN", 2) => Ok(ConsoleCommand::Login {
                username: owned(0),
                password: owned(1),
            }),
            ("PUT", 2) => Ok(ConsoleCommand::Put {
                key: owned(0),
                value: owned(1),
            }),
            ("GET", 1) => Ok(ConsoleCommand::Get { key: owned(0) }),
            ("WHEN", 3) => Ok(ConsoleCommand::When {
                key: owned(0),
                cond_key: owned(1),
                cond_value: owned(2),
            }),
            ("MPUT", n) if n > 0 && n % 2 == 0 => Ok(ConsoleCommand::MultiPut {
                pairs: args
                    .chunks(2)
                    .map(|pair| (pair[0].to_string(), pair[1].to_string()))
                    .collect(),
            }),
            ("MGET", n) if n > 0 => Ok(ConsoleCommand::MultiGet {
                keys: args.iter().map(|key| key.to_string()).collect(),
            }),
            ("REGISTER" | "LOGIN", _) => Err(anyhow!(
                "{normalized_cmd} requires exactly two arguments: {normalized_cmd} <user> <password>"
            )),
            ("PUT", _) => Err(anyhow!("PUT requires exactly two arguments: PUT <key> <value>")),
            ("GET", _) => Err(anyhow!("GET requires exactly one argument: GET <key>")),
            ("WHEN", _) => Err(anyhow!(
                "WHEN requires exactly three arguments: WHEN <key> <condKey> <condValue>"
            )),
            ("MPUT", _) => Err(anyhow!("MPUT requires key/value pairs: MPUT <k1> <v1> ...")),
            ("MGET", _) => Err(anyhow!("MGET requires at least one key: MGET <k1> ...")),
            ("EXIT" | "HELP" | "LOGOUT", _) => {
                Err(anyhow!("{normalized_cmd} takes no arguments"))
            }
            _ => Err(anyhow!("invalid command. {USAGE}")),
        }
    }
}

/// Connects to the server and runs the console on stdin/stdout until EOF,
/// `EXIT` or Ctrl-C.
pub async fn run(args: ClientArgs) -> Result<()> {
    let client = Client::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    let stdin = BufReader::new(tokio::io::stdin());
    let result = select! {
        result = run_console(&client, stdin, tokio::io::stdout()) => result,
        ctrl_c = tokio::signal::ctrl_c() => {
            if let Err(error) = ctrl_c {
                warn!(?error, "ctrl-c handler failed");
            }
            Ok(())
        }
    };

    if let Err(error) = client.close().await {
        warn!(?error, "failed to close connection cleanly");
    }
    result
}

/// Executes commands read from `input`, writing results to `output`.
///
/// On EOF or `EXIT` it keeps waiting for `WHEN` results still outstanding.
/// A transport failure ends the console with an error; anything the server
/// refuses is printed and the console carries on.
pub async fn run_console<R, W>(client: &Client, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (results_tx, mut results) = mpsc::unbounded_channel();
    let mut pending = 0usize;
    let mut lines = input.lines();

    loop {
        select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read input")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let command = match ConsoleCommand::parse(&line) {
                    Ok(ConsoleCommand::Exit) => break,
                    Ok(command) => command,
                    Err(err) => {
                        write_line(&mut output, &format!("error: {err}")).await?;
                        continue;
                    }
                };
                match command {
                    ConsoleCommand::When { key, cond_key, cond_value } => {
                        write_line(&mut output, &format!("waiting until {cond_key} = {cond_value}")).await?;
                        let report = ReportLine { key: key.clone(), results: results_tx.clone() };
                        client.get_when_with(key, cond_key, cond_value.into_bytes(), report);
                        pending += 1;
                    }
                    command => match execute(client, command).await {
                        Ok(text) => write_line(&mut output, &text).await?,
                        Err(err) if err.is_fatal() => return Err(err).context("connection to server lost"),
                        Err(err) => write_line(&mut output, &format!("error: {err}")).await?,
                    },
                }
            }
            Some(text) = results.recv() => {
                pending -= 1;
                write_line(&mut output, &text).await?;
            }
        }
    }

    while pending > 0 {
        let Some(text) = results.recv().await else {
            break;
        };
        pending -= 1;
        write_line(&mut output, &text).await?;
    }
    Ok(())
}

async fn execute(client: &Client, command: ConsoleCommand) -> Result<String, Error> {
    let text = match command {
        ConsoleCommand::Register { username, password } => {
            if client.register(username.clone(), password).await? {
                format!("registered {username}")
            } else {
                format!("registration of {username} refused")
            }
        }
        ConsoleCommand::Login { username, password } => {
            if client.authenticate(username.clone(), password).await? {
                format!("logged in as {username}")
            } else {
                "login failed".to_string()
            }
        }
        ConsoleCommand::Put { key, value } => {
            client.put(key, value.into_bytes()).await?;
            "ok".to_string()
        }
        ConsoleCommand::Get { key } => {
            let value = client.get(key.clone()).await?;
            format!("{key} = {}", display_value(value.as_deref()))
        }
        ConsoleCommand::MultiPut { pairs } => {
            client
                .multi_put(pairs.into_iter().map(|(key, value)| (key, value.into_bytes())))
                .await?;
            "ok".to_string()
        }
        ConsoleCommand::MultiGet { keys } => client
            .multi_get(keys)
            .await?
            .iter()
            .map(|(key, value)| format!("{key} = {}", display_value(value.as_deref())))
            .collect::<Vec<_>>()
            .join(", "),
        ConsoleCommand::Logout => {
            client.logout().await?;
            "logged out".to_string()
        }
        ConsoleCommand::Help => USAGE.to_string(),
        ConsoleCommand::When { .. } | ConsoleCommand::Exit => String::new(),
    };
    Ok(text)
}

fn display_value(value: Option<&[u8]>) -> String {
    match value {
        Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        None => "(nil)".to_string(),
    }
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, line: &str) -> Result<()> {
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}

/// Forwards a `WHEN` outcome to the console loop as a printable line.
struct ReportLine {
    key: String,
    results: mpsc::UnboundedSender<String>,
}

impl GetWhenCallback for ReportLine {
    fn on_success(self, value: Option<Vec<u8>>) {
        let line = format!("when: {} = {}", self.key, display_value(value.as_deref()));
        let _ = self.results.send(line);
    }

    fn on_failure(self, reason: String) {
        let _ = self.results.send(format!("when {}: error: {reason}", self.key));
    }

    fn on_error(self, error: Error) {
        let _ = self.results.send(format!("when {}: error: {error}", self.key));
    }
}
