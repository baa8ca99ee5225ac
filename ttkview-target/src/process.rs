//! プロセス制御機能
//!
//! エンジンを子プロセスとして起動し、標準入出力上のJSON Linesで通信します。
//! エンジンを実装する側は [`serve_stdio`] を使って同じプロトコルを話せます。

use crate::engine::EngineFactory;
use crate::host::{EngineHost, Outbox};
use crate::link::{Connector, EngineLink};
use crate::protocol::{Incoming, Request};
use crate::{HostError, Result};
use std::io::{BufRead, Write as _};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// エンジンを子プロセスとして起動するコネクタ
///
/// 接続のたびに新しいプロセスを起動します。
/// リンクを破棄するとプロセスは強制終了されます。
/// 非同期ランタイムの中から呼び出してください。
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessConnector {
    /// 新しいコネクタを作成する
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Connector for ProcessConnector {
    fn connect(&mut self) -> Result<EngineLink> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HostError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(HostError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(HostError::MissingPipe("stdout"))?;

        let (req_tx, req_rx) = unbounded_channel();
        let (in_tx, in_rx) = unbounded_channel();

        tokio::spawn(write_requests(stdin, req_rx));
        tokio::spawn(read_incoming(stdout, in_tx));

        debug!(program = %self.program.display(), pid = ?child.id(), "engine process spawned");
        Ok(EngineLink::with_child(req_tx, in_rx, child))
    }
}

/// リクエストを1行ずつ子プロセスの標準入力に書き込む
async fn write_requests(mut stdin: ChildStdin, mut rx: UnboundedReceiver<Request>) {
    while let Some(req) = rx.recv().await {
        let mut line = match serde_json::to_string(&req) {
            Ok(line) => line,
            Err(e) => {
                warn!(id = req.id, error = %e, "failed to encode request");
                continue;
            }
        };
        line.push('\n');

        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            warn!(error = %e, "engine stdin closed");
            break;
        }
    }
}

/// 子プロセスの標準出力からメッセージを読み取る
async fn read_incoming(stdout: ChildStdout, tx: UnboundedSender<Incoming>) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Incoming>(&line) {
                    Ok(msg) => {
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(%line, error = %e, "malformed message from engine"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "failed to read from engine");
                break;
            }
        }
    }

    debug!("engine stdout closed");
}

/// 標準入出力上でエンジンを提供する
///
/// 標準入力からリクエストを読み、標準出力に通知とレスポンスを書き込みます。
/// 標準入力が閉じると戻ります。
pub fn serve_stdio<F: EngineFactory>(factory: F) -> Result<()> {
    let (req_tx, req_rx) = unbounded_channel();
    let (out_tx, mut out_rx) = unbounded_channel::<Incoming>();

    std::thread::Builder::new()
        .name("ttkview-stdin".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Request>(&line) {
                    Ok(req) => {
                        if req_tx.send(req).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(%line, error = %e, "malformed request"),
                }
            }
        })
        .map_err(HostError::Thread)?;

    let writer = std::thread::Builder::new()
        .name("ttkview-stdout".to_string())
        .spawn(move || -> Result<()> {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            while let Some(msg) = out_rx.blocking_recv() {
                serde_json::to_writer(&mut out, &msg)?;
                out.write_all(b"\n")?;
                out.flush()?;
            }
            Ok(())
        })
        .map_err(HostError::Thread)?;

    EngineHost::new(factory, Outbox::new(out_tx)).serve(req_rx);

    match writer.join() {
        Ok(result) => result,
        Err(_) => Err(HostError::Io(std::io::Error::other("stdout writer panicked"))),
    }
}
