//! Purpose: Hold top-level CLI command dispatch for `msglog`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Each command opens the store, runs one operation, and closes it.
//! Invariants: Library `None` lookups become `NotFound` errors only here.

use super::*;
use crate::record_json::{info_json, message_json, recovery_json, write_json};
use msglog::api::{Geometry, LogStore, Message, StoreOptions, Timestamp};

pub(super) fn dispatch_command(command: Command) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "msglog", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Create {
            path,
            size,
            max_entries,
            string_table_size,
            max_strings,
            force,
        } => {
            if path.exists() && !force {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("log file already exists")
                    .with_path(&path)
                    .with_hint("Pass --force to replace it."));
            }
            let mut geometry = Geometry::derive(parse_size(&size)?);
            if let Some(max_entries) = max_entries {
                geometry.max_entries = max_entries;
            }
            if let Some(table) = string_table_size {
                geometry.string_table_size = u32::try_from(parse_size(&table)?).map_err(|_| {
                    Error::new(ErrorKind::Usage)
                        .with_message("string table size exceeds 4G")
                        .with_hint("Use a smaller --string-table-size.")
                })?;
            }
            if let Some(max_strings) = max_strings {
                geometry.max_string_entries = max_strings;
            }
            let store = LogStore::create(StoreOptions::with_geometry(&path, geometry))?;
            let info = store.info()?;
            store.close()?;
            emit_json(info_json(&info));
            Ok(RunOutcome::ok())
        }
        Command::Info { path } => {
            let store = LogStore::open(StoreOptions::existing(&path))?;
            let info = store.info()?;
            store.close()?;
            emit_json(info_json(&info));
            Ok(RunOutcome::ok())
        }
        Command::Write {
            path,
            msg,
            id,
            file,
            line,
            app,
            machine,
            channel,
            thread,
            reuse,
            create,
            size,
        } => {
            let options = if create {
                StoreOptions::new(&path, parse_size(&size)?)
            } else {
                StoreOptions::existing(&path)
            };
            let store = LogStore::open(options.with_reuse(reuse))?;
            let id = match id {
                Some(id) => id,
                None => next_id(&store)?,
            };
            let message = Message::new(id, msg)
                .with_source(file, line)
                .with_app_name(app)
                .with_machine_name(machine)
                .with_channel(channel)
                .with_thread_id(thread)
                .with_timestamp(Timestamp::now());
            let outcome = store.write_msg(&message)?;
            store.close()?;
            emit_json(write_json(id, &outcome));
            Ok(RunOutcome::ok())
        }
        Command::Get { path, id } => {
            let store = LogStore::open(StoreOptions::existing(&path))?;
            let message = store.get_message(id)?;
            store.close()?;
            let Some(message) = message else {
                return Err(Error::new(ErrorKind::NotFound)
                    .with_message("message not found")
                    .with_path(&path)
                    .with_id(id)
                    .with_hint("Use `msglog list` to see the ids in this file."));
            };
            emit_json(message_json(&message));
            Ok(RunOutcome::ok())
        }
        Command::List { path, jsonl } => {
            let store = LogStore::open(StoreOptions::existing(&path))?;
            let messages = store.get_all_messages()?;
            store.close()?;
            if jsonl {
                for message in &messages {
                    println!("{}", message_json(message));
                }
            } else {
                let values: Vec<Value> = messages.iter().map(message_json).collect();
                emit_json(json!({ "messages": values }));
            }
            Ok(RunOutcome::ok())
        }
        Command::Dump { path } => {
            let store = LogStore::open(StoreOptions::existing(&path))?;
            let dump = store.dump_log()?;
            store.close()?;
            print!("{dump}");
            Ok(RunOutcome::ok())
        }
        Command::Rotate { path } => {
            let store = LogStore::open(StoreOptions::existing(&path))?;
            let archived = store.create_new_file()?;
            store.close()?;
            emit_json(json!({ "archived": archived.display().to_string() }));
            Ok(RunOutcome::ok())
        }
        Command::Recover { path } => {
            let (store, report) = LogStore::recover(StoreOptions::existing(&path))?;
            let info = store.info()?;
            store.close()?;
            emit_json(json!({
                "recovery": recovery_json(&report),
                "info": info_json(&info),
            }));
            Ok(RunOutcome::ok())
        }
    }
}

fn next_id(store: &LogStore) -> Result<u32, Error> {
    match store.get_newest_message_id()? {
        None => Ok(1),
        Some(newest) => newest.checked_add(1).ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message("message ids are exhausted")
                .with_hint("Pass --id explicitly or rotate the file.")
        }),
    }
}
