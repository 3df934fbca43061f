//! Command dispatch: wires the configured backend into a session and a
//! transfer engine, then runs one command.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use teledrive_bot_api::BotConnection;
use teledrive_session::{
    AuthState, BackendConnection, BackendSession, ChannelId, LoginStrategy, MemoryBackend,
};
use teledrive_transfer::{TransferEngine, TransferRecord};
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::{Cli, Command};

/// How long to wait for an out-of-band login approval.
const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(300);

pub(crate) async fn run(cli: Cli, mut config: Config) -> anyhow::Result<()> {
    let connection: Box<dyn BackendConnection> = if cli.memory {
        let secret = config
            .session
            .credentials
            .bot_token
            .get_or_insert_with(|| "memory".into())
            .clone();
        config.session.destination = None;
        Box::new(
            MemoryBackend::new()
                .with_secret(secret)
                .with_channel(ChannelId("memory".into())),
        )
    } else {
        Box::new(BotConnection::new()?.with_base_url(config.api_url.clone()))
    };

    let session = BackendSession::new(config.session.clone(), connection);
    let engine = TransferEngine::new(session.clone(), config.transfer.clone())?;
    engine.tracker().on_progress(Box::new(|p| {
        info!(
            name = %p.name,
            direction = ?p.direction,
            percent = p.percent,
            parts = %format!("{}/{}", p.parts_done, p.part_count),
            bytes_per_second = p.bytes_per_second as u64,
            "progress"
        );
    }));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("SIGINT received, cancelling");
            trigger.cancel();
        }
    });

    let result = match cli.command {
        Command::Login => login(&session).await,
        Command::Upload {
            file,
            label,
            record,
        } => {
            login(&session).await?;
            upload(&engine, &file, label, record.as_deref(), &cancel).await
        }
        Command::Download { record, output } => {
            login(&session).await?;
            download(&engine, &record, &output, &cancel).await
        }
        Command::Delete { record } => {
            login(&session).await?;
            let record = read_record(&record).await?;
            let deleted = engine.delete_all(&record).await;
            println!("deleted {deleted} of {} parts", record.parts.len());
            Ok(())
        }
        Command::Status => status(&session, &config).await,
    };

    session.shutdown().await;
    result
}

/// Drives the login handshake to `Ready`, prompting the operator when a
/// confirmation or a second factor is needed.
async fn login(session: &BackendSession) -> anyhow::Result<()> {
    let mut state = session.login().await.context("login failed")?;

    if state == AuthState::AwaitingPrimaryFactor(LoginStrategy::RemoteConfirmation) {
        if let Some(token) = session.snapshot().confirmation {
            println!("Approve this login from a signed-in device: {}", token.url);
        }
        let mut rx = session.subscribe();
        let approved = tokio::time::timeout(
            CONFIRMATION_TIMEOUT,
            rx.wait_for(|s| {
                s.state.is_ready()
                    || s.state.is_terminal()
                    || s.state == AuthState::AwaitingSecondFactor
            }),
        )
        .await
        .is_ok();
        anyhow::ensure!(approved, "login was not approved in time");
        state = session.state();
    }

    if state == AuthState::AwaitingSecondFactor {
        let hint = session.snapshot().second_factor_hint;
        let password = prompt(&format!(
            "Password{}: ",
            hint.map(|h| format!(" (hint: {h})")).unwrap_or_default()
        ))
        .await?;
        state = session.submit_second_factor(&password).await?;
    }

    anyhow::ensure!(state.is_ready(), "login did not complete (state: {state})");
    info!(destination = ?session.destination(), "logged in");
    Ok(())
}

async fn prompt(message: &str) -> anyhow::Result<String> {
    eprint!("{message}");
    let mut line = String::new();
    tokio::io::BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await?;
    Ok(line.trim_end().to_string())
}

async fn upload(
    engine: &TransferEngine,
    path: &Path,
    label: Option<String>,
    record_path: Option<&Path>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open {}", path.display()))?;
    let size = file.metadata().await?.len();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".into());
    let label = label.unwrap_or_else(|| name.clone());

    let record = match engine
        .upload(file, size, &name, Some(&label), cancel)
        .await
    {
        Ok(record) => record,
        Err(failure) => {
            if !failure.orphaned.is_empty() {
                warn!(
                    orphaned = failure.orphaned.len(),
                    "some parts could not be rolled back"
                );
            }
            return Err(failure.into());
        }
    };

    let json = serde_json::to_string_pretty(&record)?;
    match record_path {
        Some(out) => {
            tokio::fs::write(out, json).await?;
            println!("record written to {}", out.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

async fn download(
    engine: &TransferEngine,
    record_path: &Path,
    output: &Path,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let record = read_record(record_path).await?;
    let mut file = tokio::fs::File::create(output)
        .await
        .with_context(|| format!("cannot create {}", output.display()))?;

    match engine.download(&record, &mut file, cancel).await {
        Ok(written) => {
            println!("{written} bytes written to {}", output.display());
            Ok(())
        }
        Err(e) => {
            drop(file);
            if let Err(rm) = tokio::fs::remove_file(output).await {
                warn!(error = %rm, "could not remove partial output");
            }
            Err(e.into())
        }
    }
}

async fn read_record(path: &Path) -> anyhow::Result<TransferRecord> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read record {}", path.display()))?;
    let record: TransferRecord = serde_json::from_str(&content)?;
    record.validate()?;
    Ok(record)
}

async fn status(session: &BackendSession, config: &Config) -> anyhow::Result<()> {
    if let Err(e) = login(session).await {
        warn!(error = %e, "login failed");
    }
    let snapshot = session.snapshot();
    println!("state:        {}", snapshot.state);
    if let Some(reason) = snapshot.last_rejection {
        println!("rejected:     {reason}");
    }
    match session.destination() {
        Some(channel) => println!("destination:  {channel}"),
        None => println!("destination:  (none)"),
    }
    println!("api url:      {}", config.api_url);
    println!("part size:    {} bytes", config.transfer.part_size_bytes);
    println!("max attempts: {}", config.transfer.max_retry_attempts);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn memory_cli(command: Command) -> Cli {
        Cli {
            config: None,
            memory: true,
            command,
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.transfer.part_size_bytes = 16;
        config.transfer.inter_part_delay_millis = 0;
        config
    }

    #[tokio::test]
    async fn memory_upload_writes_record() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("notes.txt");
        let record_path = tmp.path().join("notes.json");
        std::fs::write(&input, vec![7u8; 40]).unwrap();

        run(
            memory_cli(Command::Upload {
                file: input,
                label: None,
                record: Some(record_path.clone()),
            }),
            test_config(),
        )
        .await
        .unwrap();

        let record = read_record(&record_path).await.unwrap();
        assert_eq!(record.name, "notes.txt");
        assert_eq!(record.total_size, 40);
        assert_eq!(record.parts.len(), 3);
        assert_eq!(
            record.parts[0].caption(),
            Some("Part 1/3 of notes.txt")
        );
    }

    #[tokio::test]
    async fn missing_input_fails() {
        let err = run(
            memory_cli(Command::Upload {
                file: PathBuf::from("/nonexistent/teledrive-input"),
                label: None,
                record: None,
            }),
            test_config(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("cannot open"));
    }

    #[tokio::test]
    async fn unreadable_record_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.json");
        std::fs::write(&path, "{}").unwrap();
        assert!(read_record(&path).await.is_err());
    }

    #[tokio::test]
    async fn memory_login_succeeds() {
        run(memory_cli(Command::Login), test_config()).await.unwrap();
    }
}
