//! リモートコンテキストへのリンク
//!
//! [`Connector`] は新しいリモートコンテキストを作成し、[`EngineLink`] を返します。
//! リンクを破棄するとリモートコンテキストも終了します。

use crate::engine::EngineFactory;
use crate::host::{EngineHost, Outbox};
use crate::protocol::{Incoming, Request};
use crate::{HostError, Result};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// リンクの送信側
///
/// 子プロセスを所有している場合、破棄と同時にプロセスを終了させます。
#[derive(Debug)]
pub struct LinkSender {
    tx: UnboundedSender<Request>,
    _child: Option<tokio::process::Child>,
}

impl LinkSender {
    /// リクエストを送信する。リモートコンテキストが終了していれば失敗する
    pub fn send(&self, req: Request) -> std::result::Result<(), Request> {
        self.tx.send(req).map_err(|e| e.0)
    }

    /// リモートコンテキストが終了したか
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// リモートコンテキストとの双方向リンク
#[derive(Debug)]
pub struct EngineLink {
    sender: LinkSender,
    incoming: UnboundedReceiver<Incoming>,
}

impl EngineLink {
    /// チャネルからリンクを作成する
    pub fn new(tx: UnboundedSender<Request>, incoming: UnboundedReceiver<Incoming>) -> Self {
        Self {
            sender: LinkSender { tx, _child: None },
            incoming,
        }
    }

    /// 子プロセスを所有するリンクを作成する
    pub fn with_child(
        tx: UnboundedSender<Request>,
        incoming: UnboundedReceiver<Incoming>,
        child: tokio::process::Child,
    ) -> Self {
        Self {
            sender: LinkSender {
                tx,
                _child: Some(child),
            },
            incoming,
        }
    }

    /// 送信側と受信側に分割する
    pub fn split(self) -> (LinkSender, UnboundedReceiver<Incoming>) {
        (self.sender, self.incoming)
    }
}

/// リモートコンテキストを作成するファクトリ
pub trait Connector: Send + 'static {
    /// 新しいリモートコンテキストを作成して接続する
    fn connect(&mut self) -> Result<EngineLink>;
}

impl<F> Connector for F
where
    F: FnMut() -> Result<EngineLink> + Send + 'static,
{
    fn connect(&mut self) -> Result<EngineLink> {
        self()
    }
}

/// 専用スレッドでエンジンを動かすコネクタ
///
/// スレッドとはメッセージだけでやり取りし、メモリは共有しません。
#[derive(Debug, Clone)]
pub struct InProcessConnector<F> {
    factory: F,
    spawned: u64,
}

impl<F: EngineFactory + Clone> InProcessConnector<F> {
    /// 新しいコネクタを作成する
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            spawned: 0,
        }
    }
}

impl<F: EngineFactory + Clone> Connector for InProcessConnector<F> {
    fn connect(&mut self) -> Result<EngineLink> {
        let (req_tx, req_rx) = unbounded_channel();
        let (in_tx, in_rx) = unbounded_channel();

        self.spawned += 1;
        let name = format!("ttkview-engine-{}", self.spawned);
        let host = EngineHost::new(self.factory.clone(), Outbox::new(in_tx));

        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || host.serve(req_rx))
            .map_err(HostError::Thread)?;

        debug!(thread = %name, "engine thread spawned");
        Ok(EngineLink::new(req_tx, in_rx))
    }
}
