//! `dockling logs` command: View container console output.

use std::future::Future;
use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;

use clap::Args;
use dockling_runtime::{ContainerState, Engine};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// How often a followed log is polled for new output.
const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Args)]
pub struct LogsArgs {
    /// Container name or ID
    pub container: String,

    /// Follow log output until the container stops
    #[arg(short, long)]
    pub follow: bool,

    /// Number of lines to show from the end
    #[arg(long)]
    pub tail: Option<usize>,
}

pub async fn execute(args: LogsArgs, engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    let containers = engine.containers();
    let record = containers.inspect(&args.container)?;
    let path = containers.log_path(&record.id)?;

    let shown = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes.len() as u64,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };
    print!("{}", containers.logs(&record.id, args.tail)?);

    if args.follow && record.state == ContainerState::Running {
        follow(&path, shown, containers.wait(&record.id)).await??;
    }
    Ok(())
}

/// Copy log content past `offset` to stdout until `done` resolves, then
/// drain what is left.
pub(super) async fn follow<F: Future>(
    path: &Path,
    offset: u64,
    done: F,
) -> Result<F::Output, Box<dyn std::error::Error>> {
    let mut file = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut stdout = tokio::io::stdout();

    tokio::pin!(done);
    loop {
        tokio::select! {
            output = &mut done => {
                drain(&mut file, &mut stdout).await?;
                return Ok(output);
            }
            _ = tokio::time::sleep(FOLLOW_POLL_INTERVAL) => {
                drain(&mut file, &mut stdout).await?;
            }
        }
    }
}

async fn drain(
    file: &mut tokio::fs::File,
    stdout: &mut tokio::io::Stdout,
) -> std::io::Result<()> {
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return stdout.flush().await;
        }
        stdout.write_all(&buf[..n]).await?;
    }
}
