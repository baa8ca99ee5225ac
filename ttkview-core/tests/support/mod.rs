//! テスト用のスクリプト式エンジン
//!
//! TTK-91風の命令をごく一部だけ解釈します。
//!
//! - `LOAD Rx, =n` / `LOAD Rx, name`
//! - `ADD Rx, =n`
//! - `STORE Rx, name`
//! - `OUT Rx, =0`
//! - `PUSH SP, =n` / `PUSH SP, Rx`（`mem[SP] = v` の後に `SP -= 1`）
//! - `POP SP, Rx`
//! - `SVC SP, =HALT`
//! - `name DC n`（1000番地から4番地おきに配置）

#![allow(dead_code)]

use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use ttkview_core::{Session, SessionConfig, SessionHandle};
use ttkview_target::{
    Address, Engine, EngineCallback, EngineEvent, EngineFactory, EngineFault, InProcessConnector,
    RegisterBank, StepOutcome, Word, STACK_POINTER_REGISTER,
};

pub const STACK_BASE: Address = 2048;
pub const DATA_BASE: Address = 1000;
pub const MEMORY_SIZE: Address = 4096;

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Immediate(Word),
    Register(usize),
    Symbol(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Load(usize, Operand),
    Add(usize, Operand),
    Store(usize, String),
    Out(usize),
    Push(Operand),
    Pop(usize),
    Halt,
}

#[derive(Debug, Clone)]
struct Instruction {
    op: Op,
    line: u32,
}

pub struct ToyEngine {
    program: Vec<Instruction>,
    pc: usize,
    registers: RegisterBank,
    memory: HashMap<Address, Word>,
    symbols: BTreeMap<String, Address>,
    output: Vec<Word>,
    listeners: Vec<(String, EngineCallback)>,
}

impl ToyEngine {
    fn emit(&mut self, kind: &str, payload: serde_json::Value) {
        let event = EngineEvent::new(kind, payload);
        for (pattern, callback) in &mut self.listeners {
            if pattern == "*" || pattern == kind {
                callback(&event);
            }
        }
    }

    fn set_register(&mut self, index: usize, value: Word) {
        self.registers.set(index, value);
        self.emit("register-change", json!({ "register": index, "value": value }));
    }

    fn write(&mut self, address: Address, value: Word) {
        self.memory.insert(address, value);
        self.emit("memory-change", json!({ "address": address, "value": value }));
    }

    fn value(&self, operand: &Operand, line: u32) -> Result<Word, EngineFault> {
        match operand {
            Operand::Immediate(n) => Ok(*n),
            Operand::Register(r) => Ok(self.registers.get(*r).unwrap_or(0)),
            Operand::Symbol(name) => {
                let address = self.symbol(name, line)?;
                Ok(self.memory.get(&address).copied().unwrap_or(0))
            }
        }
    }

    fn symbol(&self, name: &str, line: u32) -> Result<Address, EngineFault> {
        self.symbols
            .get(name)
            .copied()
            .ok_or_else(|| EngineFault::new(format!("unknown symbol '{}'", name)).at_line(line))
    }

    fn next_line(&self) -> u32 {
        self.program
            .get(self.pc)
            .or_else(|| self.program.last())
            .map(|i| i.line)
            .unwrap_or(1)
    }
}

impl Engine for ToyEngine {
    fn step(&mut self) -> Result<StepOutcome, EngineFault> {
        let Some(instruction) = self.program.get(self.pc).cloned() else {
            return Err(EngineFault::new("program counter out of range"));
        };
        self.pc += 1;
        let line = instruction.line;
        let mut halted = false;

        match instruction.op {
            Op::Load(r, operand) => {
                let value = self.value(&operand, line)?;
                self.set_register(r, value);
            }
            Op::Add(r, operand) => {
                let value = self.registers.get(r).unwrap_or(0) + self.value(&operand, line)?;
                self.set_register(r, value);
            }
            Op::Store(r, name) => {
                let address = self.symbol(&name, line)?;
                let value = self.registers.get(r).unwrap_or(0);
                self.write(address, value);
            }
            Op::Out(r) => {
                let value = self.registers.get(r).unwrap_or(0);
                self.output.push(value);
            }
            Op::Push(operand) => {
                let value = self.value(&operand, line)?;
                let sp = self.registers.stack_pointer();
                self.write(sp, value);
                self.set_register(STACK_POINTER_REGISTER, sp - 1);
            }
            Op::Pop(r) => {
                let sp = self.registers.stack_pointer() + 1;
                if sp > STACK_BASE {
                    return Err(EngineFault::new("stack underflow").at_line(line));
                }
                let value = self.memory.get(&sp).copied().unwrap_or(0);
                self.set_register(STACK_POINTER_REGISTER, sp);
                self.set_register(r, value);
            }
            Op::Halt => halted = true,
        }

        if self.pc >= self.program.len() {
            halted = true;
        }

        Ok(StepOutcome {
            output: self.output.clone(),
            line: if halted { line } else { self.next_line() },
            halted,
        })
    }

    fn registers(&self) -> RegisterBank {
        self.registers
    }

    fn read_address(&self, address: Address) -> Result<Word, EngineFault> {
        if !(0..MEMORY_SIZE).contains(&address) {
            return Err(EngineFault::new("address out of range"));
        }
        Ok(self.memory.get(&address).copied().unwrap_or(0))
    }

    fn symbol_table(&self) -> BTreeMap<String, Address> {
        self.symbols.clone()
    }

    fn add_listener(&mut self, pattern: &str, callback: EngineCallback) {
        self.listeners.push((pattern.to_string(), callback));
    }
}

fn parse_register(text: &str, line: u32) -> Result<usize, EngineFault> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("SP") {
        return Ok(STACK_POINTER_REGISTER);
    }
    text.strip_prefix('R')
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|n| *n < 8)
        .ok_or_else(|| EngineFault::new(format!("bad register '{}'", text)).at_line(line))
}

fn parse_operand(text: &str, line: u32) -> Result<Operand, EngineFault> {
    let text = text.trim();
    if let Some(n) = text.strip_prefix('=') {
        return n
            .trim()
            .parse()
            .map(Operand::Immediate)
            .map_err(|_| EngineFault::new(format!("bad immediate '{}'", text)).at_line(line));
    }
    if let Ok(r) = parse_register(text, line) {
        return Ok(Operand::Register(r));
    }
    Ok(Operand::Symbol(text.to_string()))
}

fn split_args(args: &str, line: u32) -> Result<(String, String), EngineFault> {
    let (a, b) = args
        .split_once(',')
        .ok_or_else(|| EngineFault::new("expected two operands").at_line(line))?;
    Ok((a.trim().to_string(), b.trim().to_string()))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ToyFactory;

impl EngineFactory for ToyFactory {
    type Engine = ToyEngine;

    fn create(&self, source: &str) -> Result<ToyEngine, EngineFault> {
        let mut program = Vec::new();
        let mut symbols = BTreeMap::new();
        let mut memory = HashMap::new();

        for (index, raw) in source.lines().enumerate() {
            let line = index as u32 + 1;
            let text = raw.split(';').next().unwrap_or("").trim();
            if text.is_empty() {
                continue;
            }

            let words: Vec<&str> = text.split_whitespace().collect();
            if words.len() == 3 && words[1].eq_ignore_ascii_case("DC") {
                let value: Word = words[2]
                    .parse()
                    .map_err(|_| EngineFault::new("bad constant").at_line(line))?;
                let address = DATA_BASE + 4 * symbols.len() as Address;
                symbols.insert(words[0].to_string(), address);
                memory.insert(address, value);
                continue;
            }

            let (mnemonic, args) = text.split_once(' ').unwrap_or((text, ""));
            let op = match mnemonic.to_ascii_uppercase().as_str() {
                "LOAD" => {
                    let (r, operand) = split_args(args, line)?;
                    Op::Load(parse_register(&r, line)?, parse_operand(&operand, line)?)
                }
                "ADD" => {
                    let (r, operand) = split_args(args, line)?;
                    Op::Add(parse_register(&r, line)?, parse_operand(&operand, line)?)
                }
                "STORE" => {
                    let (r, name) = split_args(args, line)?;
                    Op::Store(parse_register(&r, line)?, name)
                }
                "OUT" => {
                    let (r, _) = split_args(args, line)?;
                    Op::Out(parse_register(&r, line)?)
                }
                "PUSH" => {
                    let (_, operand) = split_args(args, line)?;
                    Op::Push(parse_operand(&operand, line)?)
                }
                "POP" => {
                    let (_, r) = split_args(args, line)?;
                    Op::Pop(parse_register(&r, line)?)
                }
                "SVC" => Op::Halt,
                other => {
                    return Err(EngineFault::new(format!("unknown opcode '{}'", other)).at_line(line))
                }
            };
            program.push(Instruction { op, line });
        }

        if program.is_empty() {
            return Err(EngineFault::new("empty program"));
        }

        let mut registers = RegisterBank::new();
        registers.set(STACK_POINTER_REGISTER, STACK_BASE);

        Ok(ToyEngine {
            program,
            pc: 0,
            registers,
            memory,
            symbols,
            output: Vec::new(),
            listeners: Vec::new(),
        })
    }
}

/// テスト用エンジンに接続したセッションを起動する
pub fn session() -> SessionHandle {
    session_with(SessionConfig::default())
}

pub fn session_with(config: SessionConfig) -> SessionHandle {
    Session::spawn(InProcessConnector::new(ToyFactory), config).expect("failed to start session")
}

/// 非同期処理にタイムアウトを付ける
pub async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// 手動で操作するリモート側
pub struct ManualRemote {
    pub requests: tokio::sync::mpsc::UnboundedReceiver<ttkview_target::Request>,
    pub incoming: tokio::sync::mpsc::UnboundedSender<ttkview_target::Incoming>,
}

pub type ManualRemotes = std::sync::Arc<std::sync::Mutex<Vec<ManualRemote>>>;

/// 何も応答しないリモートに接続したセッションを起動する
///
/// 接続のたびに新しい [`ManualRemote`] が追加されます。
pub fn manual_session() -> (SessionHandle, ManualRemotes) {
    manual_session_with(SessionConfig::default())
}

pub fn manual_session_with(config: SessionConfig) -> (SessionHandle, ManualRemotes) {
    let remotes: ManualRemotes = Default::default();
    let shared = std::sync::Arc::clone(&remotes);

    let connector = move || -> ttkview_target::Result<ttkview_target::EngineLink> {
        let (req_tx, req_rx) = tokio::sync::mpsc::unbounded_channel();
        let (in_tx, in_rx) = tokio::sync::mpsc::unbounded_channel();
        shared.lock().unwrap().push(ManualRemote {
            requests: req_rx,
            incoming: in_tx,
        });
        Ok(ttkview_target::EngineLink::new(req_tx, in_rx))
    };

    let session = Session::spawn(connector, config).expect("failed to start session");
    (session, remotes)
}

/// 先読みなどプロキシが自分で送ったリクエストの応答まで処理させる
pub async fn settle(session: &SessionHandle) {
    // 1回目で通知の処理を、2回目でその通知が発行した読み出しの応答を待つ
    session.sync().await.expect("sync failed");
    session.sync().await.expect("sync failed");
}
