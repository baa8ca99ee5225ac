//! セッション
//!
//! 状態プロキシを1つのタスクで動かします。
//! コマンドとエンジンからのメッセージは、そのタスクの中で1つずつ最後まで処理されます。
//! 利用者は [`SessionHandle`] を通してプロキシを操作します。

use crate::channel::ResponseFuture;
use crate::config::SessionConfig;
use crate::dispatcher::{Descriptor, Event, Forwarder, Subscriber, SubscriberId};
use crate::errors::{ChannelError, ProxyError};
use crate::proxy::{ReadReply, Reply, StateProxy};
use crate::state::Mirror;
use crate::watcher::{MemoryWatcher, WatchView};
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, unbounded_channel, UnboundedReceiver};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};
use ttkview_target::{Address, Connector, Incoming, Response, Word};

type Ack<T> = oneshot::Sender<T>;

/// セッションへのコマンド
enum Command {
    Load { source: String, reply: Ack<Result<(), ProxyError>> },
    Step { reply: Ack<Result<(), ProxyError>> },
    Run { reply: Ack<Result<(), ProxyError>> },
    Halt { reply: Ack<Result<(), ProxyError>> },
    Reset { reply: Ack<Result<(), ProxyError>> },
    ReadAddress { address: Address, reply: Ack<Result<Reply<Word>, ProxyError>> },
    RefreshAddress { address: Address, reply: Ack<Result<ReadReply, ProxyError>> },
    Sync { reply: Ack<Result<Reply<()>, ProxyError>> },
    Send {
        kind: String,
        payload: Value,
        expect_response: bool,
        reply: Ack<Result<Option<ResponseFuture>, ProxyError>>,
    },
    Snapshot { reply: Ack<Mirror> },
    Subscribe {
        descriptor: Descriptor,
        subscriber: Box<dyn Subscriber>,
        reply: Ack<SubscriberId>,
    },
    Attach { descriptor: Descriptor, id: SubscriberId, reply: Ack<bool> },
    Unsubscribe { id: SubscriberId, reply: Ack<bool> },
    AddWatcher { reply: Ack<(SubscriberId, watch::Receiver<WatchView>)> },
    Watch { id: SubscriberId, address: Address, reply: Ack<Result<ReadReply, ProxyError>> },
    Unwatch { id: SubscriberId, address: Address, reply: Ack<Result<bool, ProxyError>> },
    RemoveWatcher { id: SubscriberId, reply: Option<Ack<bool>> },
    Shutdown,
}

/// セッション
pub struct Session;

impl Session {
    /// エンジンに接続し、セッションのタスクを起動する
    ///
    /// tokio ランタイムの中から呼び出してください。
    pub fn spawn(connector: impl Connector, config: SessionConfig) -> Result<SessionHandle, ProxyError> {
        let capacity = config.command_capacity.max(1);
        let (proxy, incoming) = StateProxy::connect(connector, config)?;
        let (tx, rx) = mpsc::channel(capacity);

        tokio::spawn(run(proxy, incoming, rx));
        debug!("session started");
        Ok(SessionHandle { tx })
    }
}

async fn recv_incoming(incoming: &mut Option<UnboundedReceiver<Incoming>>) -> Option<Incoming> {
    match incoming {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run(
    mut proxy: StateProxy,
    incoming: UnboundedReceiver<Incoming>,
    mut commands: mpsc::Receiver<Command>,
) {
    let mut incoming = Some(incoming);

    loop {
        tokio::select! {
            msg = recv_incoming(&mut incoming) => match msg {
                Some(msg) => proxy.on_incoming(msg),
                None => {
                    incoming = None;
                    proxy.on_disconnect();
                }
            },
            cmd = commands.recv() => match cmd {
                Some(Command::Shutdown) | None => break,
                Some(cmd) => {
                    if let Some(rx) = handle(&mut proxy, cmd) {
                        incoming = Some(rx);
                    }
                }
            },
        }
    }

    debug!("session stopped");
}

/// コマンドを処理する。エンジンを作り直した場合は新しい受信口を返す
fn handle(proxy: &mut StateProxy, cmd: Command) -> Option<UnboundedReceiver<Incoming>> {
    match cmd {
        Command::Load { source, reply } => {
            let _ = reply.send(proxy.load(&source));
        }
        Command::Step { reply } => {
            let _ = reply.send(proxy.step());
        }
        Command::Run { reply } => {
            let _ = reply.send(proxy.run());
        }
        Command::Halt { reply } => {
            let _ = reply.send(proxy.halt());
        }
        Command::Reset { reply } => match proxy.reset() {
            Ok(rx) => {
                let _ = reply.send(Ok(()));
                return Some(rx);
            }
            Err(e) => {
                warn!(error = %e, "failed to restart engine");
                let _ = reply.send(Err(e));
            }
        },
        Command::ReadAddress { address, reply } => {
            let _ = reply.send(proxy.read_address(address));
        }
        Command::RefreshAddress { address, reply } => {
            let _ = reply.send(proxy.refresh_address(address));
        }
        Command::Sync { reply } => {
            let _ = reply.send(proxy.sync());
        }
        Command::Send {
            kind,
            payload,
            expect_response,
            reply,
        } => {
            let _ = reply.send(proxy.send(&kind, payload, expect_response));
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(proxy.snapshot());
        }
        Command::Subscribe {
            descriptor,
            subscriber,
            reply,
        } => {
            let _ = reply.send(proxy.subscribe_boxed(descriptor, subscriber));
        }
        Command::Attach { descriptor, id, reply } => {
            let _ = reply.send(proxy.attach(descriptor, id));
        }
        Command::Unsubscribe { id, reply } => {
            let _ = reply.send(proxy.unsubscribe(id));
        }
        Command::AddWatcher { reply } => {
            let _ = reply.send(proxy.add_watcher());
        }
        Command::Watch { id, address, reply } => {
            let _ = reply.send(proxy.watch(id, address));
        }
        Command::Unwatch { id, address, reply } => {
            let _ = reply.send(proxy.unwatch(id, address));
        }
        Command::RemoveWatcher { id, reply } => {
            let removed = proxy.remove_watcher(id);
            if let Some(reply) = reply {
                let _ = reply.send(removed);
            }
        }
        Command::Shutdown => {}
    }
    None
}

/// セッションの操作口
///
/// 複製して複数のタスクから使えます。
/// すべてのハンドルが破棄されるとセッションは終了します。
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    async fn request<T>(&self, make: impl FnOnce(Ack<T>) -> Command) -> Result<T, ProxyError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| ChannelError::SessionClosed)?;
        Ok(rx.await.map_err(|_| ChannelError::SessionClosed)?)
    }

    /// セッションが終了しているか
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// プログラムを読み込む
    pub async fn load(&self, source: impl Into<String>) -> Result<(), ProxyError> {
        let source = source.into();
        self.request(|reply| Command::Load { source, reply }).await?
    }

    /// 1命令実行する
    pub async fn step(&self) -> Result<(), ProxyError> {
        self.request(|reply| Command::Step { reply }).await?
    }

    /// 停止するまで実行する
    pub async fn run(&self) -> Result<(), ProxyError> {
        self.request(|reply| Command::Run { reply }).await?
    }

    /// 実行を止める
    pub async fn halt(&self) -> Result<(), ProxyError> {
        self.request(|reply| Command::Halt { reply }).await?
    }

    /// エンジンを作り直してプログラムを読み込み直す
    pub async fn reset(&self) -> Result<(), ProxyError> {
        self.request(|reply| Command::Reset { reply }).await?
    }

    /// [`SessionHandle::reset`] の別名
    pub async fn stop(&self) -> Result<(), ProxyError> {
        self.reset().await
    }

    /// アドレスを読み出す
    pub async fn read_address(&self, address: Address) -> Result<Word, ProxyError> {
        let reply = self
            .request(|reply| Command::ReadAddress { address, reply })
            .await??;
        reply.wait().await
    }

    /// キャッシュになければアドレスを読み出す
    pub async fn refresh_address(&self, address: Address) -> Result<Word, ProxyError> {
        let reply = self
            .request(|reply| Command::RefreshAddress { address, reply })
            .await??;
        reply.value().await
    }

    /// それまでに送ったリクエストによるメッセージがすべて処理されるまで待つ
    pub async fn sync(&self) -> Result<(), ProxyError> {
        let reply = self.request(|reply| Command::Sync { reply }).await??;
        reply.wait().await
    }

    /// 任意のリクエストを送信する
    pub async fn send(
        &self,
        kind: impl Into<String>,
        payload: Value,
        expect_response: bool,
    ) -> Result<Option<Response>, ProxyError> {
        let kind = kind.into();
        let future = self
            .request(|reply| Command::Send {
                kind,
                payload,
                expect_response,
                reply,
            })
            .await??;

        match future {
            Some(future) => Ok(Some(future.await?)),
            None => Ok(None),
        }
    }

    /// 状態のコピーを取得する
    pub async fn snapshot(&self) -> Result<Mirror, ProxyError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// イベントを購読し、受信口を返す
    pub async fn subscribe(
        &self,
        descriptor: impl Into<Descriptor>,
    ) -> Result<(SubscriberId, UnboundedReceiver<Event>), ProxyError> {
        let (tx, rx) = unbounded_channel();
        let id = self.subscribe_with(descriptor, Forwarder(tx)).await?;
        Ok((id, rx))
    }

    /// 購読者を登録する
    ///
    /// 購読者はセッションのタスク上で呼び出されます。
    pub async fn subscribe_with(
        &self,
        descriptor: impl Into<Descriptor>,
        subscriber: impl Subscriber + 'static,
    ) -> Result<SubscriberId, ProxyError> {
        let descriptor = descriptor.into();
        let subscriber: Box<dyn Subscriber> = Box::new(subscriber);
        self.request(|reply| Command::Subscribe {
            descriptor,
            subscriber,
            reply,
        })
        .await
    }

    /// 購読者に経路を追加する
    pub async fn attach(&self, descriptor: impl Into<Descriptor>, id: SubscriberId) -> Result<bool, ProxyError> {
        let descriptor = descriptor.into();
        self.request(|reply| Command::Attach { descriptor, id, reply }).await
    }

    /// 購読を解除する
    pub async fn unsubscribe(&self, id: SubscriberId) -> Result<bool, ProxyError> {
        self.request(|reply| Command::Unsubscribe { id, reply }).await
    }

    /// メモリウォッチャーを作成する
    pub async fn watcher(&self) -> Result<MemoryWatcher, ProxyError> {
        let (id, view) = self.request(|reply| Command::AddWatcher { reply }).await?;
        Ok(MemoryWatcher::new(id, self.clone(), view))
    }

    pub(crate) async fn watch(&self, id: SubscriberId, address: Address) -> Result<Word, ProxyError> {
        let reply = self
            .request(|reply| Command::Watch { id, address, reply })
            .await??;
        reply.value().await
    }

    pub(crate) async fn unwatch(&self, id: SubscriberId, address: Address) -> Result<bool, ProxyError> {
        self.request(|reply| Command::Unwatch { id, address, reply })
            .await?
    }

    pub(crate) async fn remove_watcher(&self, id: SubscriberId) -> Result<(), ProxyError> {
        self.request(|reply| Command::RemoveWatcher {
            id,
            reply: Some(reply),
        })
        .await?;
        Ok(())
    }

    /// 待たずにウォッチャーの登録を解除する
    ///
    /// キューが満杯のときは空きを待って送るタスクに任せます。
    pub(crate) fn forget_watcher(&self, id: SubscriberId) {
        match self.tx.try_send(Command::RemoveWatcher { id, reply: None }) {
            Ok(()) => {}
            Err(TrySendError::Full(command)) => match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let tx = self.tx.clone();
                    runtime.spawn(async move {
                        let _ = tx.send(command).await;
                    });
                }
                Err(_) => warn!(watcher = %id, "could not unregister watcher outside runtime"),
            },
            Err(TrySendError::Closed(_)) => {
                debug!(watcher = %id, "session already closed");
            }
        }
    }

    /// セッションを終了する
    pub async fn shutdown(&self) -> Result<(), ProxyError> {
        self.tx
            .send(Command::Shutdown)
            .await
            .map_err(|_| ChannelError::SessionClosed)?;
        Ok(())
    }
}
