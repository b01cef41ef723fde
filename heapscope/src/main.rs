//! # heapscope - Main Entry Point
//!
//! Connects a session to one target, runs the requested inspections and
//! prints the results:
//! - **Live process** (`heapscope <PROCESS>` or `--pid <PID>`)
//! - **Snapshot** (`--snapshot <FILE>`, with `--reader direct|debug-engine`)

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use heapscope::cli::Args;
use heapscope::domain::{parse_address, Address, Pid, SessionError, Target, Tid, TypeHandle};
use heapscope::preflight::{check_snapshot_file, run_attach_checks};
use heapscope::process_lookup::find_process_by_name;
use heapscope::symbols::SymbolPathMode;
use heapscope::{Session, SessionConfig};
use heapscope_common::EngineError;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(SessionError::Engine(EngineError::AccessDenied { .. })) =
        err.downcast_ref::<SessionError>()
    {
        return EXIT_NOPERM;
    }
    let msg = err.to_string().to_lowercase();
    if msg.contains("permission denied") {
        EXIT_NOPERM
    } else if msg.contains("missing required argument") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

/// Resolve the target from CLI arguments.
///
/// Supports three modes:
/// - `heapscope my-app` - find process by name
/// - `heapscope --pid 1234` - explicit PID
/// - `heapscope --snapshot app.heap.json` - snapshot file
fn resolve_target(args: &Args) -> Result<Target> {
    if let Some(ref path) = args.snapshot {
        check_snapshot_file(path)?;
        return Ok(Target::Snapshot(path.clone()));
    }

    let pid = if let Some(ref name) = args.process {
        find_process_by_name(name)?.pid
    } else if let Some(pid) = args.pid {
        Pid(pid)
    } else {
        anyhow::bail!(
            "Missing required argument: PROCESS, --pid or --snapshot\n\n\
             Usage:\n  \
             heapscope my-app --threads                    Attach by name\n  \
             heapscope --pid 1234 --stats                  Explicit PID\n  \
             heapscope --snapshot app.heap.json --stats    Snapshot file\n\n\
             Run 'heapscope --help' for more options"
        )
    };
    run_attach_checks(pid.0, args.quiet)?;
    Ok(Target::Process(pid))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to encode JSON")?);
    Ok(())
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();

    if args.no_action() {
        anyhow::bail!(
            "Missing required argument: choose at least one of \
             --threads, --stats, --histogram, --object ADDR, --blocking TID"
        );
    }

    let target = resolve_target(&args)?;
    let timeout = Duration::from_millis(args.timeout_ms);

    let config = SessionConfig {
        attach_timeout: timeout,
        symbol_path: if args.append_symbols {
            String::new()
        } else {
            args.symbol_path.clone().unwrap_or_default()
        },
        symbol_cache: args.symbol_cache.clone(),
        ..SessionConfig::default()
    };
    let session = Session::with_default_engine(config);
    session.on_detach(|reason| info!("Session detached: {reason}"));

    if args.append_symbols {
        if let Some(ref paths) = args.symbol_path {
            session.set_symbol_path(paths, SymbolPathMode::Append).await?;
        }
    }

    if !args.quiet {
        eprintln!("heapscope v{} - connecting to {target}", env!("CARGO_PKG_VERSION"));
    }
    let connected = match &target {
        Target::Process(pid) => session.attach_to_process(*pid, Some(timeout)).await,
        Target::Snapshot(path) => session.load_snapshot(path, args.reader.into()).await,
    };
    connected.with_context(|| format!("Cannot connect to {target}"))?;

    let result = inspect(&session, &args).await;
    session.detach().await;
    result
}

async fn inspect(session: &Session, args: &Args) -> Result<()> {
    let cancel = CancellationToken::new();

    if args.stats {
        let stats = session.heap_statistics().await?;
        if args.json {
            print_json(&stats)?;
        } else {
            println!("HEAP");
            println!("  total  {:>16}", stats.total);
            println!("  gen0   {:>16}", stats.gen0);
            println!("  gen1   {:>16}", stats.gen1);
            println!("  gen2   {:>16}", stats.gen2);
            println!("  loh    {:>16}", stats.loh);
        }
    }

    if args.histogram {
        let histogram = session.type_histogram(cancel.clone()).await?;
        if args.json {
            print_json(&histogram)?;
        } else {
            println!("{:>10} {:>14} {:>7}  TYPE", "COUNT", "BYTES", "%");
            for stat in &histogram {
                println!(
                    "{:>10} {:>14} {:>6.1}%  {}",
                    stat.count, stat.total_size, stat.percentage, stat.name
                );
            }
        }
    }

    if args.threads {
        let threads = session.threads().await?;
        if args.json {
            print_json(&threads)?;
        } else {
            for thread in &threads {
                let blocked = if thread.likely_blocked { " [likely blocked]" } else { "" };
                println!(
                    "{} (managed {}, locks {}){blocked}",
                    thread.os_id, thread.managed_id, thread.lock_count
                );
                for line in thread.stack.lines() {
                    println!("    {line}");
                }
            }
        }
    }

    if let Some(ref object) = args.object {
        let address = parse_address(object)
            .with_context(|| format!("Invalid object address: {object}"))?;
        let type_handle = args
            .type_handle
            .as_deref()
            .map(|h| parse_address(h).map(TypeHandle))
            .transpose()
            .context("Invalid type handle")?;
        let records = session.inspect_object(Address(address), type_handle, cancel.clone()).await?;
        if args.json {
            print_json(&records)?;
        } else {
            for record in &records {
                println!("{record}");
            }
        }
    }

    if let Some(tid) = args.blocking {
        let records = session.inspect_thread_blocking(Tid(tid), cancel.clone()).await?;
        if args.json {
            print_json(&records)?;
        } else if records.is_empty() {
            println!("{}: no blocking objects found", Tid(tid));
        } else {
            for record in &records {
                println!("{record}");
            }
        }
    }

    Ok(())
}
