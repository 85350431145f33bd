mod config;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use dav_storage_core::{DavStorage, LockTable, ResumableDav, StorageBackend, StorageError};
use dav_storage_local::{FileLockTable, LocalBackend};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{Command, Config};

/// Read size when streaming input into a save.
const INPUT_CHUNK: usize = 64 * 1024;

/// Exit code when the storage refused an operation because of a lock.
const EXIT_REFUSED: u8 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Logs go to stderr; stdout carries results
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();

    let storage_config = Arc::new(config.storage_config());
    let lock_dir = config.effective_lock_dir();
    info!("Storage dir: {}", storage_config.location.display());
    info!("Lock dir: {}", lock_dir.display());

    let backend: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new());
    let lock_table: Arc<dyn LockTable> = Arc::new(FileLockTable::new(&lock_dir));
    let storage = DavStorage::open(backend, lock_table, storage_config).await?;

    let done = run(&storage, config.command).await?;
    Ok(if done {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_REFUSED)
    })
}

/// Execute one command. Returns `false` when the storage refused it.
async fn run(storage: &dyn ResumableDav, command: Command) -> anyhow::Result<bool> {
    match command {
        Command::Save { name, from } => {
            let input = open_input(from.as_deref()).await?;
            let outcome = storage.save_stream(&name, input_stream(input)).await?;
            print_json(&outcome)?;
            Ok(outcome.is_saved())
        }
        Command::Append { name, user, from } => {
            let mut input = open_input(from.as_deref()).await?;
            let mut content = Vec::new();
            input.read_to_end(&mut content).await?;
            let appended = storage.append(&name, &content, &user).await?;
            print_json(&json!({ "name": name, "appended": appended, "bytes": content.len() }))?;
            Ok(appended)
        }
        Command::Read { name } => match storage.safe_read(&name).await? {
            Some(content) => {
                write_stdout(&content).await?;
                Ok(true)
            }
            None => anyhow::bail!("{} does not exist", name),
        },
        Command::Chunk {
            name,
            offset,
            length,
        } => {
            let chunk = storage.safe_read_chunk(&name, offset, length).await?;
            info!("Read {} bytes of {} from offset {}", chunk.bytes_read, name, offset);
            write_stdout(&chunk.data).await?;
            Ok(true)
        }
        Command::Download {
            name,
            chunk_size,
            to,
        } => {
            let download = storage.download(&name, chunk_size).await?;
            let size = download.size();
            let mut output = open_output(to.as_deref()).await?;
            let mut chunks = download.into_stream();
            let mut total = 0u64;
            while let Some(chunk) = chunks.try_next().await? {
                output.write_all(&chunk.data).await?;
                total = chunk.offset;
            }
            output.flush().await?;
            if to.is_some() {
                print_json(&json!({ "name": name, "size": size, "bytes": total }))?;
            }
            Ok(true)
        }
        Command::Propfind { name } => {
            print_json(&storage.propfind(&name).await?)?;
            Ok(true)
        }
        Command::Mkcol { name, user } => {
            let result = storage.mk_collection(&name, &user).await?;
            print_json(&result)?;
            Ok(result.created)
        }
        Command::Delete { name, user } => {
            let deleted = storage.delete(&name, &user).await?;
            print_json(&json!({ "name": name, "deleted": deleted }))?;
            Ok(deleted)
        }
        Command::Move { from, to, user } => {
            let moved = storage.move_to(&from, &to, &user).await?;
            print_json(&json!({ "from": from, "to": to, "moved": moved }))?;
            Ok(moved)
        }
        Command::Lock { name, user } => {
            let result = storage.lock(&name, &user).await?;
            print_json(&json!({
                "name": name,
                "acquired": result.acquired,
                "holder": result.current_holder,
            }))?;
            Ok(result.acquired)
        }
        Command::Unlock { name, user } => {
            let previous = storage.unlock(&name, &user).await?;
            let released = previous.as_deref() == Some(user.as_str());
            print_json(&json!({ "name": name, "released": released, "holder": previous }))?;
            Ok(released)
        }
        Command::Ls { name } => {
            let name = name.unwrap_or_default();
            let (dirs, files) = storage.list_dir(&name).await?;
            print_json(&json!({ "name": name, "dirs": dirs, "files": files }))?;
            Ok(true)
        }
        Command::Url { name } => {
            println!("{}", storage.url(&name)?);
            Ok(true)
        }
    }
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_input(from: Option<&Path>) -> anyhow::Result<Box<dyn AsyncRead + Send + Unpin>> {
    let input: Box<dyn AsyncRead + Send + Unpin> = match from {
        Some(path) => Box::new(tokio::fs::File::open(path).await?),
        None => Box::new(tokio::io::stdin()),
    };
    Ok(input)
}

async fn open_output(to: Option<&Path>) -> anyhow::Result<Box<dyn AsyncWrite + Send + Unpin>> {
    let output: Box<dyn AsyncWrite + Send + Unpin> = match to {
        Some(path) => Box::new(tokio::fs::File::create(path).await?),
        None => Box::new(tokio::io::stdout()),
    };
    Ok(output)
}

async fn write_stdout(data: &[u8]) -> anyhow::Result<()> {
    let mut output = tokio::io::stdout();
    output.write_all(data).await?;
    output.flush().await?;
    Ok(())
}

/// Chunked stream over an input, for saves that do not fit in memory.
fn input_stream(
    input: Box<dyn AsyncRead + Send + Unpin>,
) -> BoxStream<'static, Result<Bytes, StorageError>> {
    stream::try_unfold(input, |mut input| async move {
        let mut buf = vec![0u8; INPUT_CHUNK];
        let read = input
            .read(&mut buf)
            .await
            .map_err(|e| StorageError::Io(format!("Failed to read input: {}", e)))?;
        if read == 0 {
            return Ok(None);
        }
        buf.truncate(read);
        Ok(Some((Bytes::from(buf), input)))
    })
    .boxed()
}
