use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cli_store_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("kv_store");

    let (mut server_child, mut server_stdout) = spawn_server(&binary, 1).await?;
    let addr = read_server_addr(&mut server_stdout).await?;

    // Drain additional server logs in the background so the pipe never fills.
    let server_log_task = tokio::spawn(async move {
        drain_stdout(server_stdout).await;
    });

    let mut alice = spawn_client(&binary, &addr).await?;
    let mut bob = spawn_client(&binary, &addr).await?;

    alice.expect("register alice pw1", "registered alice").await?;
    alice.expect("REGISTER alice pw2", "registration of alice refused").await?;
    alice.expect("login alice wrong", "login failed").await?;
    alice.expect("put k1 v1", "error: request rejected: not authenticated").await?;
    alice.expect("l alice pw1", "logged in as alice").await?;

    alice.expect("p k1 v1", "ok").await?;
    alice.expect("g k1", "k1 = v1").await?;
    alice.expect("get missing", "missing = (nil)").await?;
    alice.expect("mput a 1 b 2", "ok").await?;
    alice.expect("mget a b c", "a = 1, b = 2, c = (nil)").await?;
    alice.send_line("bogus").await?;
    let rejected = read_line_expect(&mut alice.stdout, "waiting for parse error").await?;
    assert!(rejected.starts_with("error: invalid command"), "got '{rejected}'");

    // The only session slot is taken, so bob's login waits for alice.
    bob.expect("register bob pw", "registered bob").await?;
    bob.send_line("login bob pw").await?;

    // Alice's conditional read is answered once bob can write the flag.
    alice.expect("when result flag go", "waiting until flag = go").await?;
    alice.expect("logout", "logged out").await?;
    let bob_login = read_line_expect(&mut bob.stdout, "waiting for bob login").await?;
    assert_eq!(bob_login, "logged in as bob");

    bob.expect("put result done", "ok").await?;
    bob.expect("put flag go", "ok").await?;
    let released = read_line_expect(&mut alice.stdout, "waiting for alice when result").await?;
    assert_eq!(released, "when: result = done");

    alice.send_line("exit").await.context("alice send exit")?;
    bob.send_line("e").await.context("bob send exit")?;

    ensure_success(&mut alice.child, "alice client").await?;
    ensure_success(&mut bob.child, "bob client").await?;

    // The server stays up after clients disconnect; terminate it manually.
    let _ = server_child.kill().await;
    let _ = server_child.wait().await;
    let _ = server_log_task.await;

    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn expect(&mut self, line: &str, reply: &str) -> Result<()> {
        self.send_line(line).await?;
        let got = read_line_expect(&mut self.stdout, &format!("waiting for reply to '{line}'")).await?;
        if got != reply {
            return Err(anyhow!("'{line}': expected '{reply}', got '{got}'"));
        }
        Ok(())
    }
}

async fn spawn_server(binary: &Path, max_sessions: usize) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("server")
        .arg("--listen")
        .arg("127.0.0.1:0")
        .arg("--max-sessions")
        .arg(max_sessions.to_string())
        .env("NO_COLOR", "1")
        .env("RUST_LOG_STYLE", "never")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn server")?;
    let stdout = child
        .stdout
        .take()
        .context("server stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_server_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    let line = read_line(reader)
        .await?
        .context("server did not emit listening address")?;
    let trimmed = line.trim();
    let addr = trimmed
        .split_whitespace()
        .last()
        .context("unexpected server banner format")?;
    if !addr.contains(':') {
        return Err(anyhow!("server banner missing socket: {trimmed}"));
    }
    Ok(addr.to_string())
}

async fn spawn_client(binary: &Path, addr: &str) -> Result<ClientProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("--server")
        .arg(addr)
        .env("RUST_LOG", "warn")
        .env("NO_COLOR", "1")
        .env("RUST_LOG_STYLE", "never")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn client")?;

    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    Ok(ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    })
}

async fn read_line_expect(
    reader: &mut BufReader<ChildStdout>,
    description: &str,
) -> Result<String> {
    match read_line(reader).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(anyhow!("{description}: stream closed")),
        Err(err) => Err(err.context(format!("{description}: failed to read line"))),
    }
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let read_future = reader.read_line(&mut line);
    let bytes_io = match timeout(READ_TIMEOUT, read_future).await {
        Ok(result) => result,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    let byte_count = bytes_io?;
    if byte_count == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while reader
        .read_line(&mut buffer)
        .await
        .map(|bytes| {
            let has_data = bytes > 0;
            if has_data {
                buffer.clear();
            }
            has_data
        })
        .unwrap_or(false)
    {}
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = child
        .wait()
        .await
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
