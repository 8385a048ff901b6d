use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dat_store::{
    config::Config,
    feed::{self, FeedOptions, PullOptions, RowDecoder, SnapshotRow},
    formats::{Input, InputFormat, ID_FIELD},
    ingest::{self, PipelineOptions, RowOutcome},
    server::run_with_config_until_ctrl_c,
    store::backup_codec,
    ColumnCatalog, CommitMode, Store,
};
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, warn};
use tracing_subscriber::{prelude::*, EnvFilter};
use url::Url;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to config file
    #[clap(short, long, global = true)]
    config: Option<PathBuf>,
    /// Path to the store database, overrides the config
    #[clap(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the store over HTTP until Ctrl-C is pressed.
    Serve,
    /// Ingest a file, or stdin, into the store.
    Import {
        /// File to read, `-` for stdin.
        path: PathBuf,
        /// Input format: csv, tsv, ndjson or binary.
        #[clap(short, long, default_value = "csv")]
        format: String,
        /// Field separator of delimited text.
        #[clap(long)]
        delimiter: Option<char>,
        /// Name of the primary key field.
        #[clap(short, long, default_value = ID_FIELD)]
        primary: String,
        /// Commit mode, by default overwrite for an empty store and merge otherwise.
        #[clap(short, long)]
        mode: Option<CommitMode>,
        /// Declared columns of binary input.
        #[clap(long, value_delimiter = ',')]
        columns: Vec<String>,
    },
    /// Replicate a remote change feed into the store.
    Pull {
        /// URL of the remote feed, e.g. `http://localhost:8080/_changes`.
        url: Url,
        /// Resume after this remote sequence number.
        #[clap(long, default_value_t = 0)]
        since: u64,
        /// Keep following the remote until Ctrl-C is pressed.
        #[clap(long)]
        live: bool,
    },
    /// Print the change feed as newline delimited JSON.
    Cat {
        /// Only print entries after this sequence number.
        #[clap(long, default_value_t = 0)]
        since: u64,
        /// Include row content.
        #[clap(long)]
        data: bool,
        /// Keep printing new entries until Ctrl-C is pressed.
        #[clap(long)]
        live: bool,
    },
    /// Print a row at its latest revision.
    Get {
        /// Row identity.
        id: String,
    },
    /// Write a row given as a JSON object.
    Put {
        /// Row identity.
        id: String,
        /// Row content, e.g. `{"name":"alice"}`.
        value: String,
    },
    /// Remove superseded history.
    Compact,
    /// Print the column set.
    Columns,
    /// Write a point in time dump of the database.
    Backup {
        /// File to write, `-` for stdout.
        path: PathBuf,
    },
    /// Load a dump into an empty store.
    Restore {
        /// File to read, `-` for stdin.
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();
    let args = Cli::parse();

    let mut config = if let Some(path) = args.config {
        debug!("loading config from {:?}", path);
        Config::load(path).await?
    } else {
        debug!("using default config");
        Config::default()
    };
    if let Some(db) = args.db {
        config.store.path = Some(db);
    }

    if let Command::Serve = args.command {
        return run_with_config_until_ctrl_c(config).await;
    }
    let store = Store::persistent(config.store_path()?)?;
    let res = run_command(args.command, &store, &config).await;
    store.close();
    res
}

async fn run_command(command: Command, store: &Store, config: &Config) -> Result<()> {
    match command {
        Command::Serve => unreachable!("handled before opening the store"),
        Command::Import {
            path,
            format,
            delimiter,
            primary,
            mode,
            columns,
        } => {
            let mut format: InputFormat = format.parse()?;
            if let (InputFormat::Csv { .. }, Some(delimiter)) = (format, delimiter) {
                let delimiter = u8::try_from(delimiter).context("delimiter must be a single byte")?;
                format = InputFormat::Csv { delimiter };
            }
            let input = Input::from_reader(format, open_input(&path).await?)?;
            let options = PipelineOptions {
                mode,
                primary,
                columns,
                ..config.ingest.pipeline_options()
            };
            let mut handle = ingest::spawn(store.clone(), input, options);
            while let Some(outcome) = handle.next().await {
                if let RowOutcome::Failed { id, error } = outcome {
                    warn!(?id, "row failed: {error}");
                }
            }
            let summary = handle.finish().await?;
            print_json(&summary)?;
        }
        Command::Pull { url, since, live } => {
            let cancel = CancellationToken::new();
            let options = PullOptions {
                since,
                live,
                pipeline: config.ingest.pipeline_options(),
                cancel: cancel.clone(),
            };
            // on Ctrl-C stop reading, apply what was received and print the cursor
            let interrupt = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });
            let res = feed::pull(store, url, options).await;
            interrupt.abort();
            let summary = res?;
            if summary.interrupted {
                warn!(last_seq = summary.last_seq, "pull interrupted, resume with --since");
            }
            print_json(&summary)?;
        }
        Command::Cat { since, data, live } => {
            let options = FeedOptions {
                since,
                data,
                raw: false,
                live,
                until: None,
            };
            let mut entries = Box::pin(feed::changes(store, options));
            let mut stdout = tokio::io::stdout();
            loop {
                let entry = tokio::select! {
                    entry = entries.next() => entry,
                    _ = tokio::signal::ctrl_c() => None,
                };
                let Some(entry) = entry else {
                    break;
                };
                let mut line = serde_json::to_vec(&entry?)?;
                line.push(b'\n');
                stdout.write_all(&line).await?;
            }
            stdout.flush().await?;
        }
        Command::Get { id } => {
            let row = store.get(&id)?;
            let value = RowDecoder::new(store.clone()).decode(&row.value)?;
            print_json(&SnapshotRow {
                id: row.id,
                rev: row.rev,
                value,
            })?;
        }
        Command::Put { id, value } => {
            let Value::Object(mut object) =
                serde_json::from_str(&value).context("value must be a JSON object")?
            else {
                bail!("value must be a JSON object");
            };
            object.insert(ID_FIELD.to_string(), Value::String(id));
            let options = PipelineOptions {
                mode: Some(CommitMode::Merge),
                ..config.ingest.pipeline_options()
            };
            let input = Input::objects(futures_util::stream::iter([object]));
            let (outcomes, _) = ingest::spawn(store.clone(), input, options)
                .collect()
                .await?;
            for outcome in outcomes {
                print_json(&outcome)?;
            }
        }
        Command::Compact => {
            let store = store.clone();
            let report = tokio::task::spawn_blocking(move || store.compact()).await??;
            print_json(&report)?;
        }
        Command::Columns => {
            print_json(&store.columns()?)?;
        }
        Command::Backup { path } => {
            let writer: Box<dyn AsyncWrite + Send + Unpin> = if path.as_os_str() == "-" {
                Box::new(tokio::io::stdout())
            } else {
                Box::new(
                    tokio::fs::File::create(&path)
                        .await
                        .with_context(|| format!("failed to create {}", path.display()))?,
                )
            };
            let mut sink = FramedWrite::new(writer, backup_codec());
            let (tx, mut rx) = mpsc::channel(64);
            let store = store.clone();
            let dump = tokio::task::spawn_blocking(move || {
                store.backup(|frame| tx.blocking_send(frame).is_ok())
            });
            while let Some(frame) = rx.recv().await {
                sink.send(frame).await?;
            }
            sink.into_inner().flush().await?;
            let frames = dump.await??;
            debug!(frames, "backup done");
        }
        Command::Restore { path } => {
            let frames = FramedRead::new(open_input(&path).await?, backup_codec())
                .map_ok(BytesMut::freeze)
                .try_collect::<Vec<_>>()
                .await?;
            let store = store.clone();
            let applied = tokio::task::spawn_blocking(move || store.restore(frames)).await??;
            print_json(&serde_json::json!({ "frames": applied }))?;
        }
    }
    Ok(())
}

async fn open_input(path: &Path) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(tokio::io::stdin()));
    }
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(Box::new(file))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
