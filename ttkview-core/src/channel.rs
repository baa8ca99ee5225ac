//! メッセージチャネル
//!
//! リクエストにIDを振って送信し、届いたレスポンスを保留中の継続に対応付けます。
//! IDを持たないメッセージは `message` 名前空間のイベントとして分類します。

use crate::dispatcher::Event;
use crate::errors::ChannelError;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use ttkview_target::{Incoming, LinkSender, Request, RequestId, Response, MESSAGE_NAMESPACE};

/// レスポンスを呼び出し元に返す送信口
pub type Responder = oneshot::Sender<Result<Response, ChannelError>>;

/// 保留中のリクエストの継続
pub trait Pending {
    /// レスポンスを受け取らないまま破棄される
    fn abandon(self, error: ChannelError);
}

impl Pending for Responder {
    fn abandon(self, error: ChannelError) {
        let _ = self.send(Err(error));
    }
}

/// レスポンスを待つFuture
#[derive(Debug)]
pub struct ResponseFuture {
    rx: oneshot::Receiver<Result<Response, ChannelError>>,
}

impl ResponseFuture {
    /// 送信口と対になるFutureを作成する
    pub fn channel() -> (Responder, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }
}

impl Future for ResponseFuture {
    type Output = Result<Response, ChannelError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(ChannelError::SessionClosed)))
    }
}

/// 受信メッセージの振り分け結果
#[derive(Debug)]
pub enum Routed<K> {
    /// 保留中のリクエストへのレスポンス
    Reply { pending: K, response: Response },
    /// 対応するリクエストがないレスポンス
    Orphan(Response),
    /// IDを持たないメッセージ
    Notification(Event),
}

/// メッセージチャネル
#[derive(Debug)]
pub struct MessageChannel<K> {
    sender: Option<LinkSender>,
    next_id: RequestId,
    pending: HashMap<RequestId, K>,
}

impl<K: Pending> MessageChannel<K> {
    /// 新しいチャネルを作成する
    pub fn new(sender: LinkSender) -> Self {
        Self {
            sender: Some(sender),
            next_id: 0,
            pending: HashMap::new(),
        }
    }

    /// 次に振られるリクエストID
    pub fn next_id(&self) -> RequestId {
        self.next_id
    }

    /// 保留中のリクエストの数
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// 保留中の継続への可変参照
    pub fn pending_mut(&mut self, id: RequestId) -> Option<&mut K> {
        self.pending.get_mut(&id)
    }

    /// リモートコンテキストと接続しているか
    pub fn is_connected(&self) -> bool {
        self.sender.as_ref().is_some_and(|s| !s.is_closed())
    }

    fn transmit(&mut self, kind: &str, payload: serde_json::Value) -> Result<RequestId, ChannelError> {
        let sender = self.sender.as_ref().ok_or(ChannelError::Disconnected)?;

        // 送信に失敗してもIDは消費する
        let id = self.next_id;
        self.next_id += 1;

        debug!(id, kind, "send");
        sender
            .send(Request::new(id, kind, payload))
            .map_err(|_| ChannelError::Disconnected)?;
        Ok(id)
    }

    /// レスポンスを待たずにリクエストを送信する
    pub fn post(&mut self, kind: &str, payload: serde_json::Value) -> Result<RequestId, ChannelError> {
        self.transmit(kind, payload)
    }

    /// リクエストを送信し、レスポンスが届いたときの継続を登録する
    ///
    /// 送信に失敗した場合、継続は登録されずに破棄されます。
    pub fn request(
        &mut self,
        kind: &str,
        payload: serde_json::Value,
        pending: K,
    ) -> Result<RequestId, ChannelError> {
        match self.transmit(kind, payload) {
            Ok(id) => {
                self.pending.insert(id, pending);
                Ok(id)
            }
            Err(e) => {
                pending.abandon(e.clone());
                Err(e)
            }
        }
    }

    /// 受信したメッセージを振り分ける
    ///
    /// 対応付けたレスポンスの継続は保留表から取り除かれます。
    pub fn route(&mut self, incoming: Incoming) -> Routed<K> {
        match incoming {
            Incoming::Response(response) => match self.pending.remove(&response.id) {
                Some(pending) => {
                    debug!(id = response.id, "response");
                    Routed::Reply { pending, response }
                }
                None => {
                    warn!(id = response.id, "response for unknown request, channel out of sync");
                    Routed::Orphan(response)
                }
            },
            Incoming::Notification(notification) => {
                let payload = notification.payload();
                Routed::Notification(Event::new(MESSAGE_NAMESPACE, notification.kind, payload))
            }
        }
    }

    /// 新しいリンクに切り替え、保留中のリクエストをすべて破棄する
    ///
    /// IDは引き続き増加し、再利用されません。
    pub fn reset(&mut self, sender: LinkSender) -> usize {
        let abandoned = self.abandon_all(ChannelError::EngineRestarted);
        self.sender = Some(sender);
        abandoned
    }

    /// リンクを失ったものとして保留中のリクエストをすべて破棄する
    pub fn disconnect(&mut self) -> usize {
        self.sender = None;
        self.abandon_all(ChannelError::Disconnected)
    }

    fn abandon_all(&mut self, error: ChannelError) -> usize {
        let mut ids: Vec<RequestId> = self.pending.keys().copied().collect();
        ids.sort_unstable();
        let count = ids.len();

        for id in ids {
            if let Some(pending) = self.pending.remove(&id) {
                pending.abandon(error.clone());
            }
        }
        if count > 0 {
            debug!(count, %error, "abandoned pending requests");
        }
        count
    }
}

impl<K: Pending + From<Responder>> MessageChannel<K> {
    /// リクエストを送信する
    ///
    /// `expect_response` が真ならレスポンスを待つFutureを返します。
    pub fn send(
        &mut self,
        kind: &str,
        payload: serde_json::Value,
        expect_response: bool,
    ) -> Result<Option<ResponseFuture>, ChannelError> {
        if !expect_response {
            self.post(kind, payload)?;
            return Ok(None);
        }

        let (tx, future) = ResponseFuture::channel();
        self.request(kind, payload, K::from(tx))?;
        Ok(Some(future))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use ttkview_target::{EngineLink, Notification};

    fn channel() -> (MessageChannel<Responder>, UnboundedReceiver<Request>) {
        let (tx, rx) = unbounded_channel();
        let (_in_tx, in_rx) = unbounded_channel();
        let (sender, _) = EngineLink::new(tx, in_rx).split();
        (MessageChannel::new(sender), rx)
    }

    fn response(id: RequestId, payload: serde_json::Value) -> Incoming {
        Incoming::Response(Response { id, payload })
    }

    #[tokio::test]
    async fn test_response_resolves_matching_request() {
        let (mut channel, mut sent) = channel();

        let first = channel.send("readAddress", json!({"address": 1}), true).unwrap().unwrap();
        let second = channel.send("readAddress", json!({"address": 2}), true).unwrap().unwrap();
        assert_eq!(sent.recv().await.unwrap().id, 0);
        assert_eq!(sent.recv().await.unwrap().id, 1);

        // 逆順に応答する
        for (id, value) in [(1, 20), (0, 10)] {
            match channel.route(response(id, json!({"value": value}))) {
                Routed::Reply { pending, response } => {
                    let _ = pending.send(Ok(response));
                }
                other => panic!("expected reply, got {:?}", other),
            }
        }

        assert_eq!(first.await.unwrap().payload["value"], 10);
        assert_eq!(second.await.unwrap().payload["value"], 20);
        assert_eq!(channel.pending_len(), 0);
    }

    #[test]
    fn test_fire_and_forget_still_consumes_id() {
        let (mut channel, _sent) = channel();
        assert!(channel.send("step", json!({}), false).unwrap().is_none());
        assert_eq!(channel.pending_len(), 0);
        assert_eq!(channel.next_id(), 1);
    }

    #[test]
    fn test_unknown_id_is_orphan() {
        let (mut channel, _sent) = channel();
        assert!(matches!(
            channel.route(response(42, json!({}))),
            Routed::Orphan(resp) if resp.id == 42
        ));
    }

    #[test]
    fn test_notification_is_classified_as_message_event() {
        let (mut channel, _sent) = channel();
        let incoming = Incoming::Notification(
            Notification::new("somethingNew", &json!({"answer": 42})).unwrap(),
        );

        match channel.route(incoming) {
            Routed::Notification(event) => {
                assert_eq!(event.descriptor.namespace, "message");
                assert_eq!(event.descriptor.name, "somethingNew");
                assert_eq!(event.payload["answer"], 42);
            }
            other => panic!("expected notification, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reset_rejects_pending_and_keeps_counting() {
        let (mut channel, _sent) = channel();
        let a = channel.send("readAddress", json!({"address": 1}), true).unwrap().unwrap();
        let b = channel.send("readAddress", json!({"address": 2}), true).unwrap().unwrap();

        let (tx, _rx) = unbounded_channel();
        let (_in_tx, in_rx) = unbounded_channel();
        let (sender, _) = EngineLink::new(tx, in_rx).split();
        assert_eq!(channel.reset(sender), 2);

        assert_eq!(a.await, Err(ChannelError::EngineRestarted));
        assert_eq!(b.await, Err(ChannelError::EngineRestarted));
        assert_eq!(channel.post("step", json!({})).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_send_on_closed_link_creates_no_pending_entry() {
        let (mut channel, sent) = channel();
        drop(sent);

        let err = channel.send("readAddress", json!({"address": 1}), true).unwrap_err();
        assert_eq!(err, ChannelError::Disconnected);
        assert_eq!(channel.pending_len(), 0);
    }
}
