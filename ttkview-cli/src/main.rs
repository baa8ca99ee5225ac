//! ttkview CLI - コマンドラインインターフェース
//!
//! エンジンプロセスに接続し、状態プロキシを通してプログラムを操作するREPL

use anyhow::{anyhow, bail, Context as _, Result};
use clap::Parser;
use regex::Regex;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;
use ttkview_core::{
    announce, Address, Command, MemoryWatcher, Mirror, Phase, Session, SessionConfig,
    SessionHandle, PROXY_NAMESPACE,
};
use ttkview_target::ProcessConnector;

/// ttkview - TTK-91 engine front-end
#[derive(Parser)]
#[command(name = "ttkview")]
#[command(version)]
#[command(about = "Interactive front-end mirroring the state of a TTK-91 engine process", long_about = None)]
struct Cli {
    /// Program to load on startup
    #[arg(short, long)]
    program: Option<PathBuf>,

    /// Disable memory prefetch for symbols
    #[arg(long)]
    no_prefetch: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Engine executable speaking the ttkview protocol on stdio
    #[arg(short, long)]
    engine: PathBuf,

    /// Arguments to pass to the engine
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

/// REPLの状態
struct Repl {
    runtime: Runtime,
    session: SessionHandle,
    watcher: Option<MemoryWatcher>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    println!("ttkview - TTK-91 engine front-end");
    println!("Version {}", env!("CARGO_PKG_VERSION"));
    println!();

    let mut repl = init_session(&cli)?;

    if let Some(program) = &cli.program {
        handle_load(&mut repl, &program.display().to_string())?;
    }

    run_repl(&mut repl)?;

    if let Some(watcher) = repl.watcher.take() {
        repl.runtime.block_on(watcher.destroy())?;
    }
    repl.runtime.block_on(repl.session.shutdown())?;
    Ok(())
}

/// ログ出力を初期化する
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// エンジンプロセスを起動してセッションを開始する
fn init_session(cli: &Cli) -> Result<Repl> {
    let runtime = Runtime::new().context("failed to start async runtime")?;

    println!("Starting engine: {}", cli.engine.display());
    tracing::debug!(engine = %cli.engine.display(), args = ?cli.args, "spawning engine process");
    let connector = ProcessConnector::new(&cli.engine, cli.args.clone());
    let config = SessionConfig::default().prefetch_symbols(!cli.no_prefetch);

    let session = {
        let _guard = runtime.enter();
        Session::spawn(connector, config)?
    };
    println!("Engine connected");
    println!();

    Ok(Repl {
        runtime,
        session,
        watcher: None,
    })
}

/// REPLループを実行する
fn run_repl(repl: &mut Repl) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline("(ttkview) ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                match handle_command(repl, line) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("Error: {:#}", e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

/// コマンドを処理する。終了する場合は `false` を返す
fn handle_command(repl: &mut Repl, line: &str) -> Result<bool> {
    let Some(command) = Command::parse(line) else {
        println!("Unknown command: {}", line);
        println!("Type 'help' for available commands.");
        return Ok(true);
    };

    match command {
        Command::Help => print_help(),
        Command::Quit => {
            println!("Goodbye!");
            return Ok(false);
        }
        Command::Load(path) => handle_load(repl, &path)?,
        Command::Step => handle_step(repl)?,
        Command::Run => handle_run(repl)?,
        Command::Halt => {
            repl.runtime.block_on(repl.session.halt())?;
            println!("Halt requested");
        }
        Command::Reset => handle_reset(repl)?,
        Command::Registers => print_registers(&snapshot(repl)?),
        Command::Memory(target) => handle_memory(repl, &target)?,
        Command::Stack => print_stack(&snapshot(repl)?),
        Command::Symbols(pattern) => handle_symbols(repl, pattern.as_deref())?,
        Command::Watch(target) => handle_watch(repl, &target)?,
        Command::Unwatch(target) => handle_unwatch(repl, &target)?,
        Command::Watches => print_watches(repl),
        Command::Output => print_output(&snapshot(repl)?),
        Command::Status => print_status(&snapshot(repl)?),
    }

    Ok(true)
}

/// セッションに送ったリクエストの結果がすべて反映されるまで待つ
fn settle(repl: &Repl) -> Result<()> {
    repl.runtime.block_on(async {
        repl.session.sync().await?;
        repl.session.sync().await
    })?;
    Ok(())
}

fn snapshot(repl: &Repl) -> Result<Mirror> {
    Ok(repl.runtime.block_on(repl.session.snapshot())?)
}

/// アドレスまたはシンボル名を解決する
fn resolve(repl: &Repl, target: &str) -> Result<Address> {
    if let Ok(address) = target.parse::<Address>() {
        return Ok(address);
    }
    let state = snapshot(repl)?;
    state
        .symbol_value(target)
        .map(|(address, _)| address)
        .ok_or_else(|| anyhow!("unknown symbol '{}'", target))
}

/// Loadコマンドを処理する
fn handle_load(repl: &mut Repl, path: &str) -> Result<()> {
    let source = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path))?;

    repl.runtime.block_on(repl.session.load(source))?;
    settle(repl)?;

    let state = snapshot(repl)?;
    match state.phase {
        Phase::Unloaded => {
            let fault = state.fault.as_deref().unwrap_or("unknown error");
            bail!("failed to load {}: {}", path, fault);
        }
        _ => println!("Loaded {} ({} symbols)", path, state.symbols.len()),
    }
    Ok(())
}

/// Stepコマンドを処理する
fn handle_step(repl: &mut Repl) -> Result<()> {
    let before = snapshot(repl)?;
    repl.runtime.block_on(repl.session.step())?;
    settle(repl)?;
    let after = snapshot(repl)?;

    print_progress(&before, &after);
    Ok(())
}

/// Runコマンドを処理する
fn handle_run(repl: &mut Repl) -> Result<()> {
    let before = snapshot(repl)?;
    let session = repl.session.clone();

    repl.runtime.block_on(async move {
        let (id, mut phases) = session
            .subscribe((PROXY_NAMESPACE, announce::PHASE))
            .await?;
        session.run().await?;
        println!("Running... (Ctrl-C to halt)");

        loop {
            tokio::select! {
                event = phases.recv() => match event {
                    Some(event) if event.payload["phase"] == Phase::Running.as_str() => {}
                    _ => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    session.halt().await?;
                    println!("Halted");
                    break;
                }
            }
        }

        session.unsubscribe(id).await?;
        Ok::<_, anyhow::Error>(())
    })?;

    settle(repl)?;
    let after = snapshot(repl)?;
    print_progress(&before, &after);
    Ok(())
}

/// Resetコマンドを処理する
fn handle_reset(repl: &mut Repl) -> Result<()> {
    repl.runtime.block_on(repl.session.reset())?;
    settle(repl)?;
    println!("Engine restarted");
    print_status(&snapshot(repl)?);
    Ok(())
}

/// Memoryコマンドを処理する
fn handle_memory(repl: &mut Repl, target: &str) -> Result<()> {
    let address = resolve(repl, target)?;
    let value = repl.runtime.block_on(repl.session.refresh_address(address))?;
    println!("[{}] = {}", address, value);
    Ok(())
}

/// Symbolsコマンドを処理する
fn handle_symbols(repl: &mut Repl, pattern: Option<&str>) -> Result<()> {
    let filter = pattern
        .map(Regex::new)
        .transpose()
        .context("invalid symbol pattern")?;
    let state = snapshot(repl)?;

    let symbols: Vec<&String> = state
        .symbols
        .keys()
        .filter(|name| filter.as_ref().map_or(true, |re| re.is_match(name)))
        .collect();

    if symbols.is_empty() {
        println!("No symbols found");
        return Ok(());
    }

    println!("Symbols ({} found):", symbols.len());
    for name in symbols {
        match state.symbol_value(name) {
            Some((address, Some(value))) => println!("  {} @ {} = {}", name, address, value),
            Some((address, None)) => println!("  {} @ {}", name, address),
            None => {}
        }
    }
    Ok(())
}

/// Watchコマンドを処理する
fn handle_watch(repl: &mut Repl, target: &str) -> Result<()> {
    let address = resolve(repl, target)?;

    if repl.watcher.is_none() {
        repl.watcher = Some(repl.runtime.block_on(repl.session.watcher())?);
    }
    let Some(watcher) = repl.watcher.as_ref() else {
        return Ok(());
    };

    let value = repl.runtime.block_on(watcher.watch(address))?;
    println!("Watching [{}] = {}", address, value);
    Ok(())
}

/// Unwatchコマンドを処理する
fn handle_unwatch(repl: &mut Repl, target: &str) -> Result<()> {
    let address = resolve(repl, target)?;
    let Some(watcher) = repl.watcher.as_ref() else {
        println!("Not watching [{}]", address);
        return Ok(());
    };

    if repl.runtime.block_on(watcher.unwatch(address))? {
        println!("Stopped watching [{}]", address);
    } else {
        println!("Not watching [{}]", address);
    }
    Ok(())
}

/// ステップ前後の変化を表示する
fn print_progress(before: &Mirror, after: &Mirror) {
    for (index, (old, new)) in before
        .registers
        .as_slice()
        .iter()
        .zip(after.registers.as_slice())
        .enumerate()
    {
        if old != new {
            println!("  {} = {} (was {})", register_name(index), new, old);
        }
    }

    let printed = before.output.len().min(after.output.len());
    for value in &after.output[printed..] {
        println!("Output: {}", value);
    }

    if after.fault != before.fault {
        if let Some(fault) = &after.fault {
            println!("Fault: {}", fault);
        }
    }

    println!("Line {} ({})", after.line, after.phase);
}

fn register_name(index: usize) -> String {
    if index == ttkview_core::STACK_POINTER_REGISTER {
        "SP".to_string()
    } else {
        format!("R{}", index)
    }
}

fn print_registers(state: &Mirror) {
    for (index, value) in state.registers.as_slice().iter().enumerate() {
        println!("  {:<3} {}", register_name(index), value);
    }
}

fn print_stack(state: &Mirror) {
    let Some(base) = state.stack.base() else {
        println!("No stack");
        return;
    };

    if state.stack.is_empty() {
        println!("Stack is empty (base {})", base);
        return;
    }

    println!("Stack (base {}, {} entries):", base, state.stack.len());
    for (address, value) in state.stack.entries() {
        let value = value.map_or_else(|| "?".to_string(), |v| v.to_string());
        match state.stack.metadata(address) {
            Some(meta) => println!("  [{}] {} (pushed on line {})", address, value, meta.pushed_on_line),
            None => println!("  [{}] {}", address, value),
        }
    }
    if !state.stack.is_consistent() {
        println!("  (some values are still being fetched)");
    }
}

fn print_watches(repl: &Repl) {
    let values = repl.watcher.as_ref().map(MemoryWatcher::values).unwrap_or_default();
    if values.is_empty() {
        println!("No watched addresses");
        return;
    }
    for (address, value) in values {
        println!("  [{}] = {}", address, value);
    }
}

fn print_output(state: &Mirror) {
    if state.output.is_empty() {
        println!("No output");
        return;
    }
    let values: Vec<String> = state.output.iter().map(ToString::to_string).collect();
    println!("Output: {}", values.join(" "));
}

fn print_status(state: &Mirror) {
    println!("Phase: {}", state.phase);
    println!("Line: {}", state.line);
    if let Some(fault) = &state.fault {
        println!("Last fault: {}", fault);
    }
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("  help           - Show this help message");
    println!("  quit/exit/q    - Exit");
    println!();
    println!("Execution commands:");
    println!("  load <file>    - Load a program");
    println!("  step (s)       - Execute one instruction");
    println!("  run (r)        - Run until the program halts");
    println!("  halt           - Stop a running program");
    println!("  reset (stop)   - Restart the engine and reload the program");
    println!();
    println!("Inspection commands:");
    println!("  regs           - Show registers");
    println!("  mem <loc>      - Show memory at address or symbol");
    println!("  stack (bt)     - Show the reconstructed stack");
    println!("  symbols [re]   - List symbols, optionally filtered by regex");
    println!("  watch <loc>    - Watch an address or symbol");
    println!("  unwatch <loc>  - Stop watching");
    println!("  watches        - Show watched values");
    println!("  output         - Show program output");
    println!("  status         - Show execution phase and line");
    println!();
    println!("Examples:");
    println!("  load sum.k91");
    println!("  mem count");
    println!("  symbols ^c");
}
