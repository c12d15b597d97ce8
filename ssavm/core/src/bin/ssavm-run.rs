use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use ssavm_core::{ApInt, ErrorTrace, FlatMemory, Machine, Module, Value};
use std::io::Read;
use std::path::PathBuf;

/// Interpret a JSON-encoded IR module against the flat reference oracle.
#[derive(Parser)]
#[command(name = "ssavm-run", about)]
struct Args {
    /// Request file; read from stdin when omitted.
    input: Option<PathBuf>,
    /// Upper bound on interpreted instructions.
    #[arg(long, default_value_t = 1_000_000)]
    max_steps: u64,
    /// Size of the oracle's flat memory, in bytes.
    #[arg(long, default_value_t = 64 * 1024)]
    memory: usize,
}

#[derive(Deserialize)]
struct Request {
    module: Module,
    entry: String,
    /// Integer arguments for the entry function.
    #[serde(default)]
    args: Vec<ApInt>,
    /// Return values handed back for external calls, in call order.
    #[serde(default)]
    extern_returns: Vec<ApInt>,
}

#[derive(Serialize)]
struct Response {
    exit: Option<Value>,
    steps: u64,
    faulted: bool,
    trace: Vec<ErrorTrace>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let raw = match &args.input {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };
    let request: Request = serde_json::from_str(&raw).context("malformed request")?;

    let entry = request
        .module
        .func_by_name(&request.entry)
        .with_context(|| format!("no function named '{}'", request.entry))?;
    let mut machine = Machine::new(request.module, FlatMemory::with_capacity(args.memory));
    machine.init_globals()?;
    machine.create_thread(1, entry, request.args.into_iter().map(Value::int).collect())?;

    let mut steps = 0u64;
    let mut pending: Option<Value> = None;
    let mut returns = request.extern_returns.into_iter();
    loop {
        if machine.error_flag() {
            break;
        }
        if steps >= args.max_steps {
            bail!("step limit of {} exceeded", args.max_steps);
        }
        let empty = machine.step_thread(1, pending.take())?;
        steps += 1;
        if empty {
            break;
        }
        if machine.thread_awaiting_return(1) {
            let value = returns.next().unwrap_or_else(|| ApInt::zero(64));
            pending = Some(Value::int(value));
        }
    }

    let response = Response {
        exit: machine.thread_exit_value(1).cloned(),
        steps,
        faulted: machine.error_flag(),
        trace: machine.stack_trace().to_vec(),
    };
    serde_json::to_writer_pretty(std::io::stdout(), &response)?;
    println!();
    Ok(())
}
