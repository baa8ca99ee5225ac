//! エンジンホスト
//!
//! 隔離されたコンテキスト（専用スレッドまたは子プロセス）でエンジンを動かし、
//! プロトコルのリクエストをエンジン呼び出しに、エンジンのコールバックを
//! プロトコルの通知に変換します。

use crate::engine::{Engine as _, EngineFactory, EngineFault};
use crate::protocol::{
    event, message, request, Address, AddressValue, ErrorPayload, EventMessage, Incoming,
    LoadPayload, OutputMessage, ProtocolErrorPayload, ReadAddressPayload, Request, RequestId,
    SetRegistersMessage, SetSymbolTableMessage, UpdateStackPointerMessage,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// コントローラへの送信口
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: UnboundedSender<Incoming>,
}

impl Outbox {
    /// 新しい送信口を作成する
    pub fn new(tx: UnboundedSender<Incoming>) -> Self {
        Self { tx }
    }

    /// メッセージを送信する。受信側が閉じていれば `false`
    pub fn post(&self, msg: Incoming) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// コントローラ側が切断されたか
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// 通知を送信する
    pub fn notify<T: Serialize>(&self, kind: &str, body: &T) -> bool {
        match Incoming::notification(kind, body) {
            Ok(msg) => self.post(msg),
            Err(e) => {
                warn!(kind, error = %e, "failed to encode notification");
                false
            }
        }
    }

    /// エンジンイベントを `event` 通知として送信する
    pub fn event(&self, kind: &str, payload: Value) -> bool {
        self.notify(
            message::EVENT,
            &EventMessage {
                kind: kind.to_string(),
                payload,
            },
        )
    }

    /// レスポンスを送信する
    pub fn respond<T: Serialize>(&self, id: RequestId, payload: &T) -> bool {
        match Incoming::response(id, payload) {
            Ok(msg) => self.post(msg),
            Err(e) => {
                warn!(id, error = %e, "failed to encode response");
                false
            }
        }
    }

    fn fault(&self, kind: &str, fault: &EngineFault) -> bool {
        let payload = serde_json::to_value(fault).unwrap_or(Value::Null);
        self.event(kind, payload)
    }
}

/// ステップ実行後の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepStatus {
    Continue,
    Stopped,
}

/// エンジンホスト
pub struct EngineHost<F: EngineFactory> {
    factory: F,
    engine: Option<F::Engine>,
    outbox: Outbox,
}

impl<F: EngineFactory> EngineHost<F> {
    /// 新しいホストを作成する
    pub fn new(factory: F, outbox: Outbox) -> Self {
        Self {
            factory,
            engine: None,
            outbox,
        }
    }

    /// リクエストを受け取り続ける
    ///
    /// 受信口が閉じる（コントローラがリンクを破棄する）と戻ります。
    /// ブロッキングで待機するため、非同期ランタイムの外で呼び出してください。
    pub fn serve(mut self, mut inbox: UnboundedReceiver<Request>) {
        debug!("engine host started");

        while let Some(req) = inbox.blocking_recv() {
            if req.kind == request::RUN {
                if !self.run(&mut inbox) {
                    break;
                }
            } else {
                self.handle(req);
            }
        }

        debug!("engine host stopped");
    }

    /// 1つのリクエストを処理する（`run` 以外）
    pub fn handle(&mut self, req: Request) {
        debug!(id = req.id, kind = %req.kind, "request");

        match req.kind.as_str() {
            request::LOAD => match req.decode::<LoadPayload>() {
                Ok(payload) => self.load(&payload.program),
                Err(e) => self.protocol_error(&req, e.to_string()),
            },
            request::STEP => {
                self.step();
            }
            request::RUN => {
                debug!("run requested while already running");
            }
            request::STOP => {
                debug!("stop requested while idle");
            }
            request::READ_ADDRESS => match req.decode::<ReadAddressPayload>() {
                Ok(payload) => self.read_address(req.id, payload.address),
                Err(e) => self.protocol_error(&req, e.to_string()),
            },
            request::SYNC => {
                self.outbox.respond(req.id, &serde_json::json!({}));
            }
            _ => self.protocol_error(&req, format!("unknown request type '{}'", req.kind)),
        }
    }

    /// プログラムを読み込む
    ///
    /// 毎回新しいエンジンを作成します。
    fn load(&mut self, program: &str) {
        self.engine = None;

        let mut engine = match self.factory.create(program) {
            Ok(engine) => engine,
            Err(fault) => {
                warn!(%fault, "failed to load program");
                self.outbox.fault(event::ERROR, &fault);
                return;
            }
        };

        let outbox = self.outbox.clone();
        engine.add_listener(
            "*",
            Box::new(move |ev| {
                outbox.event(&ev.kind, ev.payload.clone());
            }),
        );

        self.outbox.notify(
            message::UPDATE_STACK_POINTER,
            &UpdateStackPointerMessage {
                address: engine.stack_pointer(),
            },
        );
        self.outbox.notify(
            message::SET_REGISTERS,
            &SetRegistersMessage {
                registers: engine.registers().as_slice().to_vec(),
            },
        );
        self.outbox.notify(
            message::SET_SYMBOL_TABLE,
            &SetSymbolTableMessage {
                symbols: engine.symbol_table(),
            },
        );

        self.engine = Some(engine);
    }

    /// 1命令実行する
    fn step(&mut self) -> StepStatus {
        let Some(engine) = self.engine.as_mut() else {
            self.outbox
                .fault(event::TRAP, &EngineFault::new("no program loaded"));
            return StepStatus::Stopped;
        };

        let old_sp = engine.stack_pointer();

        let outcome = match engine.step() {
            Ok(outcome) => outcome,
            Err(fault) => {
                warn!(%fault, "engine trapped");
                self.outbox.fault(event::TRAP, &fault);
                return StepStatus::Stopped;
            }
        };

        let registers = engine.registers();
        self.outbox.notify(
            message::OUTPUT,
            &OutputMessage {
                output: outcome.output,
                registers: registers.as_slice().to_vec(),
                line: outcome.line,
                halted: outcome.halted,
            },
        );

        if registers.stack_pointer() != old_sp {
            self.outbox.notify(
                message::UPDATE_STACK_POINTER,
                &UpdateStackPointerMessage {
                    address: registers.stack_pointer(),
                },
            );
        }

        if outcome.halted {
            StepStatus::Stopped
        } else {
            StepStatus::Continue
        }
    }

    /// 停止するまで実行する
    ///
    /// 命令の合間に届いたリクエストも処理します。
    /// リンクが切断された場合は `false` を返します。
    fn run(&mut self, inbox: &mut UnboundedReceiver<Request>) -> bool {
        debug!("run started");

        loop {
            loop {
                match inbox.try_recv() {
                    Ok(req) => match req.kind.as_str() {
                        request::STOP => {
                            debug!("run stopped by request");
                            return true;
                        }
                        request::RUN => {}
                        request::LOAD => {
                            self.handle(req);
                            return true;
                        }
                        _ => self.handle(req),
                    },
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return false,
                }
            }

            if self.outbox.is_closed() {
                return false;
            }

            if self.step() == StepStatus::Stopped {
                debug!("run finished");
                return true;
            }
        }
    }

    fn read_address(&self, id: RequestId, address: Address) {
        let result = match self.engine.as_ref() {
            Some(engine) => engine.read_address(address),
            None => Err(EngineFault::new("no program loaded")),
        };

        match result {
            Ok(value) => {
                self.outbox.respond(id, &AddressValue { address, value });
            }
            Err(fault) => {
                self.outbox.respond(
                    id,
                    &ErrorPayload {
                        error: fault.message,
                    },
                );
            }
        }
    }

    fn protocol_error(&self, req: &Request, message: String) {
        warn!(id = req.id, kind = %req.kind, %message, "protocol error");
        let payload = ProtocolErrorPayload {
            request_type: req.kind.clone(),
            message,
        };
        self.outbox.event(
            event::PROTOCOL_ERROR,
            serde_json::to_value(payload).unwrap_or(Value::Null),
        );
    }
}
