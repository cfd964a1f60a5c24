//! Operator commands that read and write the server's store directly.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Subcommand;
use serde::Serialize;
use tracing::warn;

use sigpost_core::store::{Pending, unix_now};
use sigpost_core::{ClientId, Signal, Store, StreamId};

#[derive(Subcommand)]
pub enum CtlAction {
    /// List alive clients.
    List {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Queue a command for a client.
    Cmd {
        /// Target client id.
        id: ClientId,

        /// Free-form command text.
        #[arg(required_unless_present = "stock", conflicts_with = "stock")]
        text: Vec<String>,

        /// Stock command name (whoami, hostname, pwd, ls, ipconfig).
        #[arg(long)]
        stock: Option<String>,
    },

    /// Queue a local file to be pushed to a client.
    Push { id: ClientId, file: PathBuf },

    /// Ask a client to upload one of its files.
    Pull { id: ClientId, file: String },
}

#[derive(Debug, Serialize)]
struct ClientRow {
    index: usize,
    stream_id: StreamId,
    last_seen: f64,
    seconds_ago: f64,
    pending: Pending,
}

/// Run one operator action and return what should be printed.
pub fn run(store: &Store, action: CtlAction) -> Result<String> {
    match action {
        CtlAction::List { json } => list(store, json),
        CtlAction::Cmd { id, text, stock } => {
            let id = id.get();
            warn_if_unknown(store, id)?;
            let queued = match stock {
                Some(name) => {
                    let Some(signal) = Signal::from_name(&name).filter(|s| s.is_stock()) else {
                        let names: Vec<&str> = Signal::stock_commands().map(Signal::name).collect();
                        bail!("unknown stock command '{name}' (expected one of {})", names.join(", "));
                    };
                    signal.code().to_string()
                }
                None => text.join(" "),
            };
            if queued.trim().is_empty() {
                bail!("command text must not be empty");
            }
            store.enqueue_command(id, &queued)?;
            Ok(format!("Queued command for {id}."))
        }
        CtlAction::Push { id, file } => {
            let id = id.get();
            warn_if_unknown(store, id)?;
            if !file.is_file() {
                bail!("'{}' does not exist or is not a file", file.display());
            }
            let path = file.canonicalize()?;
            store.enqueue_outbound_file(id, &path.to_string_lossy())?;
            Ok(format!("Queued {} for {id}.", path.display()))
        }
        CtlAction::Pull { id, file } => {
            let id = id.get();
            warn_if_unknown(store, id)?;
            if file.trim().is_empty() {
                bail!("file name must not be empty");
            }
            store.enqueue_inbound_file(id, file.trim())?;
            Ok(format!("Requested {} from {id}.", file.trim()))
        }
    }
}

fn list(store: &Store, json: bool) -> Result<String> {
    let now = unix_now();
    let rows = store
        .list_alive()?
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            Ok(ClientRow {
                index,
                stream_id: record.stream_id,
                last_seen: record.last_seen,
                seconds_ago: (now - record.last_seen).max(0.0),
                pending: store.pending(record.stream_id)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if json {
        return Ok(serde_json::to_string_pretty(&rows)?);
    }
    if rows.is_empty() {
        return Ok("No clients alive.".to_string());
    }
    let mut out = format!(
        "{:>5}  {:>14}  {:>9}  {:>4}  {:>4}  {:>4}",
        "#", "client", "seen (s)", "cmds", "push", "pull"
    );
    for row in &rows {
        out.push_str(&format!(
            "\n{:>5}  {:>14}  {:>9.1}  {:>4}  {:>4}  {:>4}",
            row.index,
            row.stream_id,
            row.seconds_ago,
            row.pending.commands,
            row.pending.outbound_files,
            row.pending.inbound_files
        ));
    }
    Ok(out)
}

/// Queuing for an unknown client is allowed; it gets the work if it shows up.
fn warn_if_unknown(store: &Store, id: StreamId) -> Result<()> {
    if !store.is_alive(id)? {
        warn!(stream_id = id, "Client is not currently alive; queuing anyway");
    }
    Ok(())
}
