//! 状態プロキシ
//!
//! エンジンの状態（レジスタ、メモリ、シンボル表、実行行、スタック）の
//! ローカルコピーを所有し、エンジンとのすべての通信を仲介します。
//!
//! プロキシはディスパッチャ、`message` 名前空間のリスナー、`event` 名前空間の
//! リスナーの3つを持ち、受信したメッセージをそれぞれに明示的に転送します。
//! 外部から観測できる変更はすべて `proxy` 名前空間のイベントとして通知します。

use crate::channel::{MessageChannel, Pending, Responder, ResponseFuture, Routed};
use crate::config::SessionConfig;
use crate::dispatcher::{Descriptor, Dispatcher, Event, Subscriber, SubscriberId};
use crate::errors::{ChannelError, DispatchError, ProxyError};
use crate::listener::ScopedListener;
use crate::stack::StackChange;
use crate::state::{Mirror, Phase};
use crate::watcher::{watch_listener, WatchView};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};
use ttkview_target::{
    event, message, request, Address, AddressValue, Connector, EngineFault, EventMessage, Incoming,
    MemoryChange, OutputMessage, ProtocolErrorPayload, RegisterBank, RegisterChange, RequestId,
    Response, SetRegistersMessage, SetSymbolTableMessage, UpdateStackPointerMessage, Word,
    EVENT_NAMESPACE, MESSAGE_NAMESPACE, REGISTER_COUNT, STACK_POINTER_REGISTER,
};

/// プロキシが状態の変更を通知する名前空間
pub const PROXY_NAMESPACE: &str = "proxy";

/// `proxy` 名前空間のイベント名
pub mod announce {
    /// `{register, value}`
    pub const REGISTERS: &str = "registers";
    /// `{address, value}`
    pub const MEMORY: &str = "memory";
    /// `{base, len, consistent}`
    pub const STACK: &str = "stack";
    /// `{from, to}`
    pub const STACK_REBASED: &str = "stack-rebased";
    /// `{count}`
    pub const SYMBOLS: &str = "symbols";
    /// `{output, line}`
    pub const OUTPUT: &str = "output";
    /// `{phase}`
    pub const PHASE: &str = "phase";
    /// `{kind, message}`
    pub const FAULT: &str = "fault";
    /// `{abandoned}`
    pub const RESTARTED: &str = "restarted";
}

type ValueSender = oneshot::Sender<Result<Word, ProxyError>>;

/// プロキシの処理結果を待つ受信口
#[derive(Debug)]
pub struct Reply<T> {
    rx: oneshot::Receiver<Result<T, ProxyError>>,
}

impl<T> Reply<T> {
    fn channel() -> (oneshot::Sender<Result<T, ProxyError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// 結果を待つ
    pub async fn wait(self) -> Result<T, ProxyError> {
        self.rx
            .await
            .unwrap_or(Err(ProxyError::Channel(ChannelError::SessionClosed)))
    }
}

/// メモリ読み出しの結果
#[derive(Debug)]
pub enum ReadReply {
    /// キャッシュ済み
    Ready(Word),
    /// エンジンの応答待ち
    Pending(Reply<Word>),
}

impl ReadReply {
    /// 値を待つ
    pub async fn value(self) -> Result<Word, ProxyError> {
        match self {
            ReadReply::Ready(value) => Ok(value),
            ReadReply::Pending(reply) => reply.wait().await,
        }
    }
}

/// 保留中のリクエストの継続
#[derive(Debug)]
pub enum Continuation {
    /// 呼び出し元にレスポンスをそのまま返す
    Caller(Responder),
    /// 読み出した値をメモリキャッシュに反映する
    Fill {
        address: Address,
        /// 送信時のプログラム世代
        generation: u64,
        waiters: Vec<ValueSender>,
    },
    /// 順序バリア
    Sync(oneshot::Sender<Result<(), ProxyError>>),
}

impl From<Responder> for Continuation {
    fn from(tx: Responder) -> Self {
        Continuation::Caller(tx)
    }
}

impl Pending for Continuation {
    fn abandon(self, error: ChannelError) {
        match self {
            Continuation::Caller(tx) => tx.abandon(error),
            Continuation::Fill { waiters, .. } => {
                for waiter in waiters {
                    let _ = waiter.send(Err(error.clone().into()));
                }
            }
            Continuation::Sync(tx) => {
                let _ = tx.send(Err(error.into()));
            }
        }
    }
}

struct WatchEntry {
    view: Arc<watch::Sender<WatchView>>,
    /// 値の到着を待っているアドレス
    pending: BTreeSet<Address>,
}

/// リスナーが操作するプロキシの状態
struct ProxyCore {
    mirror: Mirror,
    channel: MessageChannel<Continuation>,
    config: SessionConfig,
    /// 読み込みのたびに増える。古いプログラムへの読み出し結果を捨てるために使う
    generation: u64,
    /// アドレスごとの実行中の読み出し
    fills: HashMap<Address, RequestId>,
    watchers: HashMap<SubscriberId, WatchEntry>,
    /// `event` 通知から取り出したエンジンイベント
    forwarded: VecDeque<Event>,
    announcements: VecDeque<Event>,
}

impl ProxyCore {
    fn announce(&mut self, name: &str, payload: Value) {
        self.announcements
            .push_back(Event::new(PROXY_NAMESPACE, name, payload));
    }

    fn announce_stack(&mut self) {
        let stack = &self.mirror.stack;
        let payload = json!({
            "base": stack.base(),
            "len": stack.len(),
            "consistent": stack.is_consistent(),
        });
        self.announce(announce::STACK, payload);
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.mirror.phase == phase {
            return;
        }
        debug!(from = %self.mirror.phase, to = %phase, "phase");
        self.mirror.phase = phase;
        self.announce(announce::PHASE, json!({ "phase": phase.as_str() }));
    }

    fn record_fault(&mut self, kind: &str, fault: EngineFault) {
        warn!(kind, %fault, line = ?fault.line, "engine fault");
        self.announce(
            announce::FAULT,
            json!({ "kind": kind, "message": &fault.message, "line": fault.line }),
        );
        self.mirror.fault = Some(fault.message);
    }

    /// アドレスを読み出す（同じアドレスの実行中の読み出しがあれば相乗りする）
    fn fill(&mut self, address: Address, waiter: Option<ValueSender>) -> Result<(), ChannelError> {
        if let Some(id) = self.fills.get(&address).copied() {
            if let Some(Continuation::Fill { waiters, .. }) = self.channel.pending_mut(id) {
                waiters.extend(waiter);
                return Ok(());
            }
        }
        self.read(address, waiter)
    }

    /// 常に新しいリクエストでアドレスを読み出す
    fn read(&mut self, address: Address, waiter: Option<ValueSender>) -> Result<(), ChannelError> {
        let continuation = Continuation::Fill {
            address,
            generation: self.generation,
            waiters: waiter.into_iter().collect(),
        };
        let id = self.channel.request(
            request::READ_ADDRESS,
            json!({ "address": address }),
            continuation,
        )?;
        self.fills.insert(address, id);
        Ok(())
    }

    fn prefetch(&mut self, address: Address) {
        if let Err(e) = self.fill(address, None) {
            warn!(address, error = %e, "failed to fetch memory");
        }
    }

    /// メモリキャッシュに書き込み、スタックとウォッチャーに反映する
    fn store(&mut self, address: Address, value: Word) {
        self.mirror.memory.insert(address, value);

        let sp = self.mirror.stack_pointer();
        if self.mirror.stack.mirror(address, value, sp) {
            self.announce_stack();
        }

        for entry in self.watchers.values_mut() {
            if entry.pending.remove(&address) {
                entry.view.send_modify(|view| {
                    view.insert(address, value);
                });
            }
        }

        self.announce(announce::MEMORY, json!({ "address": address, "value": value }));
    }

    /// 1つのレジスタを更新する
    fn change_register(&mut self, index: usize, value: Word) -> Result<(), DispatchError> {
        let old = self
            .mirror
            .registers
            .set(index, value)
            .ok_or_else(|| DispatchError::Invalid {
                descriptor: Descriptor::new(EVENT_NAMESPACE, event::REGISTER_CHANGE),
                reason: format!("register index {} out of range", index),
            })?;

        if old != value {
            self.announce(announce::REGISTERS, json!({ "register": index, "value": value }));
        }
        if index == STACK_POINTER_REGISTER {
            self.reconstruct_stack(old, value);
        }
        Ok(())
    }

    fn reconstruct_stack(&mut self, old: Address, new: Address) {
        let line = self.mirror.line;
        match self
            .mirror
            .stack
            .reconstruct(old, new, line, &self.mirror.memory, self.config.max_stack_depth)
        {
            StackChange::Unchanged => {}
            StackChange::Pushed { missing, .. } => {
                // スタックポインタに近い値から先読みする。残りは書き込みか読み出しで埋まる
                let limit = self.config.stack_prefetch_limit;
                if missing.len() > limit {
                    debug!(missing = missing.len(), limit, "limiting stack prefetch");
                }
                for address in missing.into_iter().rev().take(limit) {
                    self.prefetch(address);
                }
                self.announce_stack();
            }
            StackChange::Popped { .. } => self.announce_stack(),
            StackChange::Rebased { from, to } => {
                self.announce(announce::STACK_REBASED, json!({ "from": from, "to": to }));
                self.announce_stack();
            }
        }
    }

    /// ウォッチャーの値を破棄し、監視中のアドレスを取得待ちに戻す
    fn invalidate_watched(&mut self) -> BTreeSet<Address> {
        let mut addresses = BTreeSet::new();
        for entry in self.watchers.values_mut() {
            let watched: Vec<Address> = entry.view.borrow().keys().copied().collect();
            entry.view.send_modify(WatchView::clear);
            entry.pending.extend(watched);
            addresses.extend(entry.pending.iter().copied());
        }
        addresses
    }

    /// 監視中のアドレスを読み直す
    fn refetch_watched(&mut self) {
        for address in self.invalidate_watched() {
            self.prefetch(address);
        }
    }

    /// レスポンスを継続に渡す
    fn complete(&mut self, response: Response, continuation: Continuation) {
        match continuation {
            Continuation::Caller(tx) => {
                let _ = tx.send(Ok(response));
            }
            Continuation::Sync(tx) => {
                let result = match remote_error(&response) {
                    Some(error) => Err(ProxyError::Remote(error)),
                    None => Ok(()),
                };
                let _ = tx.send(result);
            }
            Continuation::Fill {
                address,
                generation,
                waiters,
            } => {
                if self.fills.get(&address) == Some(&response.id) {
                    self.fills.remove(&address);
                }
                let result = self.apply_read(address, generation, &response);
                for waiter in waiters {
                    let _ = waiter.send(result.clone().map_err(ProxyError::Remote));
                }
            }
        }
    }

    fn apply_read(
        &mut self,
        address: Address,
        generation: u64,
        response: &Response,
    ) -> Result<Word, String> {
        if let Some(error) = remote_error(response) {
            warn!(address, %error, "read failed");
            return Err(error);
        }

        let read = response.decode::<AddressValue>().map_err(|e| {
            warn!(id = response.id, error = %e, "malformed read response");
            e.to_string()
        })?;
        if read.address != address {
            warn!(requested = address, answered = read.address, "read answered for another address");
        }

        if generation == self.generation {
            self.store(address, read.value);
        } else {
            debug!(address, "discarding read issued before reload");
        }
        Ok(read.value)
    }

    /// 読み込みの確認前に届いた、前のプログラムからのメッセージか
    fn is_stale(&self, kind: &str) -> bool {
        if self.mirror.phase != Phase::Loading {
            return false;
        }
        debug!(kind, "dropping message from previous program");
        true
    }

    fn on_output(&mut self, payload: &Value) -> Result<(), DispatchError> {
        let msg = OutputMessage::deserialize(payload)?;
        if self.is_stale(message::OUTPUT) {
            return Ok(());
        }
        self.mirror.output = msg.output;
        self.mirror.line = msg.line;

        let body = json!({ "output": &self.mirror.output, "line": msg.line });
        self.announce(announce::OUTPUT, body);
        if msg.halted {
            self.set_phase(Phase::Halted);
        }
        Ok(())
    }

    fn on_set_registers(&mut self, payload: &Value) -> Result<(), DispatchError> {
        let msg = SetRegistersMessage::deserialize(payload)?;
        if msg.registers.len() != REGISTER_COUNT {
            return Err(DispatchError::Invalid {
                descriptor: Descriptor::new(MESSAGE_NAMESPACE, message::SET_REGISTERS),
                reason: format!(
                    "expected {} registers, got {}",
                    REGISTER_COUNT,
                    msg.registers.len()
                ),
            });
        }
        let registers = RegisterBank::from_slice(&msg.registers);

        // R0 はスタックに関係しないので直接反映する
        if let Some(r0) = registers.get(0) {
            if self.mirror.registers.set(0, r0) != Some(r0) {
                self.announce(announce::REGISTERS, json!({ "register": 0, "value": r0 }));
            }
        }
        for index in 1..REGISTER_COUNT {
            if let Some(value) = registers.get(index) {
                self.change_register(index, value)?;
            }
        }

        if self.mirror.phase == Phase::Loading {
            self.set_phase(Phase::Loaded);
        }
        Ok(())
    }

    fn on_symbol_table(&mut self, payload: &Value) -> Result<(), DispatchError> {
        let msg = SetSymbolTableMessage::deserialize(payload)?;
        self.mirror.symbols = msg.symbols;

        let count = self.mirror.symbols.len();
        self.announce(announce::SYMBOLS, json!({ "count": count }));

        if self.config.prefetch_symbols {
            let addresses: BTreeSet<Address> = self.mirror.symbols.values().copied().collect();
            for address in addresses {
                self.prefetch(address);
            }
        }
        Ok(())
    }

    fn on_update_stack_pointer(&mut self, payload: &Value) -> Result<(), DispatchError> {
        let msg = UpdateStackPointerMessage::deserialize(payload)?;
        if self.mirror.phase == Phase::Loading {
            // 読み込み中は最後に届いた値をそのままベースにする
            if self.mirror.registers.set(STACK_POINTER_REGISTER, msg.address) != Some(msg.address) {
                let body = json!({ "register": STACK_POINTER_REGISTER, "value": msg.address });
                self.announce(announce::REGISTERS, body);
            }
            self.mirror.stack.clear();
            self.mirror.stack.anchor(msg.address);
            self.announce_stack();
            return Ok(());
        }
        if msg.address != self.mirror.stack_pointer() {
            return self.change_register(STACK_POINTER_REGISTER, msg.address);
        }
        self.mirror.stack.anchor(msg.address);
        Ok(())
    }

    fn on_event_message(&mut self, payload: &Value) -> Result<(), DispatchError> {
        let msg = EventMessage::deserialize(payload)?;
        self.forwarded
            .push_back(Event::new(EVENT_NAMESPACE, msg.kind, msg.payload));
        Ok(())
    }

    fn on_address_response(&mut self, payload: &Value) -> Result<(), DispatchError> {
        let read = AddressValue::deserialize(payload)?;
        if self.is_stale(message::ADDRESS_RESPONSE) {
            return Ok(());
        }
        self.store(read.address, read.value);
        Ok(())
    }

    fn on_register_change(&mut self, payload: &Value) -> Result<(), DispatchError> {
        let change = RegisterChange::deserialize(payload)?;
        if self.is_stale(event::REGISTER_CHANGE) {
            return Ok(());
        }
        self.change_register(change.register, change.value)
    }

    fn on_memory_change(&mut self, payload: &Value) -> Result<(), DispatchError> {
        let change = MemoryChange::deserialize(payload)?;
        if self.is_stale(event::MEMORY_CHANGE) {
            return Ok(());
        }
        self.store(change.address, change.value);
        Ok(())
    }

    fn on_load_error(&mut self, payload: &Value) -> Result<(), DispatchError> {
        let fault = EngineFault::deserialize(payload)?;
        self.record_fault(event::ERROR, fault);
        if self.mirror.phase == Phase::Loading {
            self.set_phase(Phase::Unloaded);
        }
        Ok(())
    }

    fn on_trap(&mut self, payload: &Value) -> Result<(), DispatchError> {
        let fault = EngineFault::deserialize(payload)?;
        self.record_fault(event::TRAP, fault);
        if self.mirror.phase.is_loaded() {
            self.set_phase(Phase::Halted);
        }
        Ok(())
    }

    fn on_protocol_error(&mut self, payload: &Value) -> Result<(), DispatchError> {
        let err = ProtocolErrorPayload::deserialize(payload)?;
        warn!(request = %err.request_type, message = %err.message, "engine rejected request");
        Ok(())
    }
}

fn remote_error(response: &Response) -> Option<String> {
    response
        .payload
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn message_listener() -> ScopedListener<ProxyCore> {
    ScopedListener::new(MESSAGE_NAMESPACE)
        .on(message::OUTPUT, ProxyCore::on_output)
        .on(message::SET_REGISTERS, ProxyCore::on_set_registers)
        .on(message::SET_SYMBOL_TABLE, ProxyCore::on_symbol_table)
        .on(message::UPDATE_STACK_POINTER, ProxyCore::on_update_stack_pointer)
        .on(message::EVENT, ProxyCore::on_event_message)
        .on(message::ADDRESS_RESPONSE, ProxyCore::on_address_response)
}

fn event_listener() -> ScopedListener<ProxyCore> {
    ScopedListener::new(EVENT_NAMESPACE)
        .on(event::REGISTER_CHANGE, ProxyCore::on_register_change)
        .on(event::MEMORY_CHANGE, ProxyCore::on_memory_change)
        .on(event::ERROR, ProxyCore::on_load_error)
        .on(event::TRAP, ProxyCore::on_trap)
        .on(event::PROTOCOL_ERROR, ProxyCore::on_protocol_error)
}

/// 状態プロキシ
///
/// 1つのタスクから操作されることを前提とします。
/// 受信したメッセージは [`StateProxy::on_incoming`] に到着順に渡してください。
pub struct StateProxy {
    dispatcher: Dispatcher,
    messages: ScopedListener<ProxyCore>,
    events: ScopedListener<ProxyCore>,
    core: ProxyCore,
    connector: Box<dyn Connector>,
}

impl StateProxy {
    /// エンジンに接続してプロキシを作成する
    ///
    /// エンジンからの受信口を返します。
    pub fn connect(
        mut connector: impl Connector,
        config: SessionConfig,
    ) -> Result<(Self, UnboundedReceiver<Incoming>), ProxyError> {
        let (sender, incoming) = connector.connect()?.split();

        let proxy = Self {
            dispatcher: Dispatcher::new(),
            messages: message_listener(),
            events: event_listener(),
            core: ProxyCore {
                mirror: Mirror::new(),
                channel: MessageChannel::new(sender),
                config,
                generation: 0,
                fills: HashMap::new(),
                watchers: HashMap::new(),
                forwarded: VecDeque::new(),
                announcements: VecDeque::new(),
            },
            connector: Box::new(connector),
        };
        Ok((proxy, incoming))
    }

    /// 現在の状態
    pub fn mirror(&self) -> &Mirror {
        &self.core.mirror
    }

    /// 状態のコピー
    pub fn snapshot(&self) -> Mirror {
        self.core.mirror.clone()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// 応答待ちのリクエストの数
    pub fn pending_requests(&self) -> usize {
        self.core.channel.pending_len()
    }

    /// エンジンと接続しているか
    pub fn is_connected(&self) -> bool {
        self.core.channel.is_connected()
    }

    fn require_program(&self) -> Result<(), ProxyError> {
        if self.core.mirror.phase == Phase::Unloaded {
            return Err(ProxyError::NotLoaded);
        }
        Ok(())
    }

    /// プログラムを読み込む
    ///
    /// 状態をすべて消去し、エンジンが `setRegisters` を返した時点で読み込み完了とします。
    pub fn load(&mut self, source: &str) -> Result<(), ProxyError> {
        debug!(bytes = source.len(), "load");

        self.core.generation += 1;
        self.core.fills.clear();
        self.core.mirror.source = Some(source.to_string());
        self.core.mirror.clear();
        self.core.announce_stack();
        self.core.set_phase(Phase::Loading);

        let result = self
            .core
            .channel
            .post(request::LOAD, json!({ "program": source }));
        if result.is_ok() {
            self.core.refetch_watched();
        }
        self.flush();
        result?;
        Ok(())
    }

    /// 1命令実行する
    pub fn step(&mut self) -> Result<(), ProxyError> {
        self.require_program()?;
        self.core.channel.post(request::STEP, json!({}))?;
        self.core.set_phase(Phase::Stepped);
        self.flush();
        Ok(())
    }

    /// 停止するまで実行する
    pub fn run(&mut self) -> Result<(), ProxyError> {
        self.require_program()?;
        self.core.channel.post(request::RUN, json!({}))?;
        self.core.set_phase(Phase::Running);
        self.flush();
        Ok(())
    }

    /// 実行中のプログラムを止める（エンジンは再起動しない）
    pub fn halt(&mut self) -> Result<(), ProxyError> {
        self.core.channel.post(request::STOP, json!({}))?;
        if self.core.mirror.phase == Phase::Running {
            self.core.set_phase(Phase::Loaded);
        }
        self.flush();
        Ok(())
    }

    /// エンジンを作り直し、最後に読み込んだプログラムを読み込み直す
    ///
    /// 応答待ちのリクエストはすべて `EngineRestarted` で破棄されます。
    /// 新しいエンジンからの受信口を返します。
    pub fn reset(&mut self) -> Result<UnboundedReceiver<Incoming>, ProxyError> {
        let (sender, incoming) = self.connector.connect()?.split();
        let abandoned = self.core.channel.reset(sender);
        debug!(abandoned, "engine restarted");

        self.core.fills.clear();
        self.core.announce(announce::RESTARTED, json!({ "abandoned": abandoned }));

        match self.core.mirror.source.clone() {
            Some(source) => {
                if let Err(e) = self.load(&source) {
                    warn!(error = %e, "failed to reload program after restart");
                }
            }
            None => {
                self.core.generation += 1;
                self.core.mirror.clear();
                // 読み込み時にまとめて取得し直す
                self.core.invalidate_watched();
                self.flush();
            }
        }
        Ok(incoming)
    }

    /// エンジンとの接続が切れたときの処理
    pub fn on_disconnect(&mut self) {
        let abandoned = self.core.channel.disconnect();
        warn!(abandoned, "engine link closed");
        self.core.fills.clear();
        self.core.set_phase(Phase::Unloaded);
        self.flush();
    }

    /// アドレスを読み出す
    ///
    /// 毎回新しいリクエストを送ります。同じアドレスへの読み出しも束ねません。
    pub fn read_address(&mut self, address: Address) -> Result<Reply<Word>, ProxyError> {
        let (tx, reply) = Reply::channel();
        self.core.read(address, Some(tx))?;
        Ok(reply)
    }

    /// キャッシュにない場合だけアドレスを読み出す
    pub fn refresh_address(&mut self, address: Address) -> Result<ReadReply, ProxyError> {
        if let Some(value) = self.core.mirror.memory.get(address) {
            return Ok(ReadReply::Ready(value));
        }
        let (tx, reply) = Reply::channel();
        self.core.fill(address, Some(tx))?;
        Ok(ReadReply::Pending(reply))
    }

    /// それまでに送ったリクエストの結果がすべて届くのを待つ
    pub fn sync(&mut self) -> Result<Reply<()>, ProxyError> {
        let (tx, reply) = Reply::channel();
        self.core
            .channel
            .request(request::SYNC, json!({}), Continuation::Sync(tx))?;
        Ok(reply)
    }

    /// 任意のリクエストを送信する
    pub fn send(
        &mut self,
        kind: &str,
        payload: Value,
        expect_response: bool,
    ) -> Result<Option<ResponseFuture>, ProxyError> {
        Ok(self.core.channel.send(kind, payload, expect_response)?)
    }

    /// イベントを購読する
    pub fn subscribe(
        &mut self,
        descriptor: impl Into<Descriptor>,
        subscriber: impl Subscriber + 'static,
    ) -> SubscriberId {
        self.dispatcher.register(descriptor, subscriber)
    }

    /// ボックス化された購読者を登録する
    pub fn subscribe_boxed(
        &mut self,
        descriptor: impl Into<Descriptor>,
        subscriber: Box<dyn Subscriber>,
    ) -> SubscriberId {
        self.dispatcher.register_boxed(descriptor, subscriber)
    }

    /// 購読者に経路を追加する
    pub fn attach(&mut self, descriptor: impl Into<Descriptor>, id: SubscriberId) -> bool {
        self.dispatcher.attach(descriptor, id)
    }

    /// 購読を解除する
    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.core.watchers.remove(&id);
        self.dispatcher.remove(id)
    }

    /// ウォッチャーを登録する
    pub fn add_watcher(&mut self) -> (SubscriberId, watch::Receiver<WatchView>) {
        let (tx, rx) = watch::channel(WatchView::new());
        let view = Arc::new(tx);

        let id = self.dispatcher.register(
            (EVENT_NAMESPACE, event::MEMORY_CHANGE),
            watch_listener(Arc::clone(&view)),
        );
        self.core.watchers.insert(
            id,
            WatchEntry {
                view,
                pending: BTreeSet::new(),
            },
        );
        debug!(watcher = %id, "watcher added");
        (id, rx)
    }

    /// ウォッチャーにアドレスを追加する
    pub fn watch(&mut self, id: SubscriberId, address: Address) -> Result<ReadReply, ProxyError> {
        let cached = self.core.mirror.memory.get(address);
        let entry = self
            .core
            .watchers
            .get_mut(&id)
            .ok_or(ProxyError::UnknownWatcher(id))?;

        if let Some(value) = cached {
            entry.view.send_modify(|view| {
                view.insert(address, value);
            });
            return Ok(ReadReply::Ready(value));
        }

        entry.pending.insert(address);
        let (tx, reply) = Reply::channel();
        self.core.fill(address, Some(tx))?;
        Ok(ReadReply::Pending(reply))
    }

    /// ウォッチャーからアドレスを取り除く
    pub fn unwatch(&mut self, id: SubscriberId, address: Address) -> Result<bool, ProxyError> {
        let entry = self
            .core
            .watchers
            .get_mut(&id)
            .ok_or(ProxyError::UnknownWatcher(id))?;

        let was_pending = entry.pending.remove(&address);
        let was_watched = entry.view.send_if_modified(|view| view.remove(&address).is_some());
        Ok(was_pending || was_watched)
    }

    /// ウォッチャーをディスパッチャから取り除く
    pub fn remove_watcher(&mut self, id: SubscriberId) -> bool {
        let known = self.core.watchers.remove(&id).is_some();
        let routed = self.dispatcher.remove(id);
        debug!(watcher = %id, "watcher removed");
        known || routed
    }

    /// エンジンから受信したメッセージを処理する
    pub fn on_incoming(&mut self, incoming: Incoming) {
        match self.core.channel.route(incoming) {
            Routed::Reply { pending, response } => self.core.complete(response, pending),
            Routed::Orphan(_) => {}
            Routed::Notification(event) => {
                let handled =
                    self.messages
                        .deliver(&mut self.core, &event.descriptor, &event.payload);
                if handled == 0 {
                    warn!(kind = %event.descriptor.name, "unknown message type");
                }
                self.dispatcher.dispatch_event(&event);
            }
        }
        self.flush();
    }

    /// 転送されたエンジンイベントと状態変更の通知を配送する
    fn flush(&mut self) {
        loop {
            if let Some(event) = self.core.forwarded.pop_front() {
                let handled = self
                    .events
                    .deliver(&mut self.core, &event.descriptor, &event.payload);
                if handled == 0 {
                    debug!(kind = %event.descriptor.name, "engine event without proxy handler");
                }
                self.dispatcher.dispatch_event(&event);
            } else if let Some(event) = self.core.announcements.pop_front() {
                self.dispatcher.dispatch_event(&event);
            } else {
                break;
            }
        }
    }
}
