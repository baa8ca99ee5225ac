//! イベントディスパッチャ
//!
//! (名前空間, 名前) をキーとする publish/subscribe レジストリです。
//! どちらの次元にもワイルドカード `*` を使えます。

use crate::errors::DispatchError;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{trace, warn};

/// 名前空間・名前のワイルドカード
pub const WILDCARD: &str = "*";

/// 名前空間が省略された場合の名前空間
pub const DEFAULT_NAMESPACE: &str = "__default";

/// イベントの完全修飾名
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Descriptor {
    pub namespace: String,
    pub name: String,
}

impl Descriptor {
    /// 新しい記述子を作成する
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// すべてのイベントにマッチする記述子 `(*, *)`
    pub fn any() -> Self {
        Self::new(WILDCARD, WILDCARD)
    }

    /// 名前空間内のすべてのイベントにマッチする記述子 `(namespace, *)`
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self::new(namespace, WILDCARD)
    }
}

impl From<&str> for Descriptor {
    fn from(name: &str) -> Self {
        Self::new(DEFAULT_NAMESPACE, name)
    }
}

impl From<(&str, &str)> for Descriptor {
    fn from((namespace, name): (&str, &str)) -> Self {
        Self::new(namespace, name)
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// 配送されるイベント
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub descriptor: Descriptor,
    pub payload: Value,
}

impl Event {
    /// 新しいイベントを作成する
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, payload: Value) -> Self {
        Self {
            descriptor: Descriptor::new(namespace, name),
            payload,
        }
    }

    /// ペイロードを型付きで取り出す
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, DispatchError> {
        Ok(T::deserialize(&self.payload)?)
    }
}

/// ディスパッチャに登録できる購読者
pub trait Subscriber: Send {
    /// イベントを受け取る
    fn on_event(&mut self, event: &Event) -> Result<(), DispatchError>;
}

impl<F> Subscriber for F
where
    F: FnMut(&Event) -> Result<(), DispatchError> + Send,
{
    fn on_event(&mut self, event: &Event) -> Result<(), DispatchError> {
        self(event)
    }
}

/// 受け取ったイベントをチャネルに転送する購読者
#[derive(Debug, Clone)]
pub struct Forwarder(pub UnboundedSender<Event>);

impl Subscriber for Forwarder {
    fn on_event(&mut self, event: &Event) -> Result<(), DispatchError> {
        self.0.send(event.clone()).map_err(|_| DispatchError::Closed)
    }
}

/// 購読者ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// イベントディスパッチャ
///
/// 配送順は、完全一致 → `(*, name)` → `(namespace, *)` → `(*, *)` の順で、
/// 同じバケット内では登録順です。
/// 複数のバケットにマッチする購読者には、最も優先度の高い位置で1回だけ配送します。
#[derive(Default)]
pub struct Dispatcher {
    subscribers: HashMap<SubscriberId, Box<dyn Subscriber>>,
    routes: HashMap<String, HashMap<String, Vec<SubscriberId>>>,
    next_id: u64,
}

impl Dispatcher {
    /// 新しいディスパッチャを作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// 購読者を登録する
    pub fn register(
        &mut self,
        descriptor: impl Into<Descriptor>,
        subscriber: impl Subscriber + 'static,
    ) -> SubscriberId {
        self.register_boxed(descriptor, Box::new(subscriber))
    }

    /// ボックス化された購読者を登録する
    pub fn register_boxed(
        &mut self,
        descriptor: impl Into<Descriptor>,
        subscriber: Box<dyn Subscriber>,
    ) -> SubscriberId {
        let id = SubscriberId(self.next_id);
        self.next_id += 1;
        self.subscribers.insert(id, subscriber);
        self.attach(descriptor, id);
        id
    }

    /// 登録済みの購読者に経路を追加する
    pub fn attach(&mut self, descriptor: impl Into<Descriptor>, id: SubscriberId) -> bool {
        if !self.subscribers.contains_key(&id) {
            return false;
        }

        let Descriptor { namespace, name } = descriptor.into();
        let bucket = self
            .routes
            .entry(namespace)
            .or_default()
            .entry(name)
            .or_default();
        if !bucket.contains(&id) {
            bucket.push(id);
        }
        true
    }

    /// 1つの経路を削除する
    ///
    /// 経路がなくなっても購読者自体は残ります。
    pub fn unregister(&mut self, descriptor: impl Into<Descriptor>, id: SubscriberId) -> bool {
        let Descriptor { namespace, name } = descriptor.into();
        let Some(events) = self.routes.get_mut(&namespace) else {
            return false;
        };
        let Some(bucket) = events.get_mut(&name) else {
            return false;
        };
        let Some(index) = bucket.iter().position(|x| *x == id) else {
            return false;
        };
        bucket.remove(index);
        true
    }

    /// 購読者をすべての経路から削除する
    pub fn remove(&mut self, id: SubscriberId) -> bool {
        for events in self.routes.values_mut() {
            for bucket in events.values_mut() {
                bucket.retain(|x| *x != id);
            }
        }
        self.subscribers.remove(&id).is_some()
    }

    /// 購読者が登録されているか
    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.contains_key(&id)
    }

    /// 登録されている購読者の数
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// 購読者が1つもいないか
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// 記述子ちょうどのバケットに登録された購読者
    fn bucket(&self, namespace: &str, name: &str) -> &[SubscriberId] {
        self.routes
            .get(namespace)
            .and_then(|events| events.get(name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// 記述子に配送される購読者を配送順に取得する
    pub fn listeners(&self, descriptor: &Descriptor) -> Vec<SubscriberId> {
        let Descriptor { namespace, name } = descriptor;
        let buckets = [
            self.bucket(namespace, name),
            self.bucket(WILDCARD, name),
            self.bucket(namespace, WILDCARD),
            self.bucket(WILDCARD, WILDCARD),
        ];

        let mut ids: Vec<SubscriberId> = Vec::new();
        for id in buckets.into_iter().flatten() {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        ids
    }

    /// イベントを配送し、配送できた購読者の数を返す
    ///
    /// 購読者がエラーを返しても、残りの購読者への配送は続けます。
    pub fn dispatch(&mut self, descriptor: impl Into<Descriptor>, payload: Value) -> usize {
        let event = Event {
            descriptor: descriptor.into(),
            payload,
        };
        self.dispatch_event(&event)
    }

    /// 作成済みのイベントを配送する
    pub fn dispatch_event(&mut self, event: &Event) -> usize {
        let mut delivered = 0;

        for id in self.listeners(&event.descriptor) {
            let Some(subscriber) = self.subscribers.get_mut(&id) else {
                continue;
            };
            match subscriber.on_event(event) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(subscriber = %id, event = %event.descriptor, error = %e, "listener failed"),
            }
        }

        trace!(event = %event.descriptor, delivered, "dispatched");
        delivered
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("subscribers", &self.subscribers.len())
            .field("routes", &self.routes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> impl Subscriber {
        let log = Arc::clone(log);
        move |_: &Event| -> Result<(), DispatchError> {
            log.lock().unwrap().push(tag);
            Ok(())
        }
    }

    #[test]
    fn test_dispatch_priority_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();

        // 登録順をわざと逆にする
        dispatcher.register(Descriptor::any(), recorder(&log, "any"));
        dispatcher.register(("event", "*"), recorder(&log, "namespace"));
        dispatcher.register(("*", "memory-change"), recorder(&log, "name"));
        dispatcher.register(("event", "memory-change"), recorder(&log, "exact"));

        let delivered = dispatcher.dispatch(("event", "memory-change"), json!({}));

        assert_eq!(delivered, 4);
        assert_eq!(*log.lock().unwrap(), vec!["exact", "name", "namespace", "any"]);
    }

    #[test]
    fn test_registration_order_within_bucket() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(("message", "output"), recorder(&log, "first"));
        dispatcher.register(("message", "output"), recorder(&log, "second"));

        dispatcher.dispatch(("message", "output"), Value::Null);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_non_matching_events_are_not_delivered() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(("event", "memory-change"), recorder(&log, "exact"));
        dispatcher.register(("message", "*"), recorder(&log, "messages"));

        assert_eq!(dispatcher.dispatch(("event", "register-change"), Value::Null), 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_subscriber_on_two_buckets_fires_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        let id = dispatcher.register(("event", "*"), recorder(&log, "watcher"));
        dispatcher.attach(Descriptor::any(), id);

        assert_eq!(dispatcher.dispatch(("event", "memory-change"), Value::Null), 1);
        assert_eq!(*log.lock().unwrap(), vec!["watcher"]);
    }

    #[test]
    fn test_failing_listener_does_not_abort_delivery() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("tick", |_: &Event| -> Result<(), DispatchError> {
            Err(DispatchError::Closed)
        });
        dispatcher.register("tick", recorder(&log, "after"));

        assert_eq!(dispatcher.dispatch("tick", Value::Null), 1);
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[test]
    fn test_bare_name_uses_default_namespace() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register((DEFAULT_NAMESPACE, "tick"), recorder(&log, "tick"));

        assert_eq!(dispatcher.dispatch("tick", Value::Null), 1);
    }

    #[test]
    fn test_remove_clears_every_route() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        let id = dispatcher.register(("event", "memory-change"), recorder(&log, "w"));
        dispatcher.attach(Descriptor::any(), id);

        assert!(dispatcher.remove(id));
        assert!(dispatcher.listeners(&Descriptor::new("event", "memory-change")).is_empty());
        assert!(dispatcher.is_empty());
        assert!(!dispatcher.attach("tick", id));
    }

    #[test]
    fn test_unregister_single_route() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        let id = dispatcher.register(("event", "memory-change"), recorder(&log, "w"));
        dispatcher.attach(("event", "register-change"), id);

        assert!(dispatcher.unregister(("event", "memory-change"), id));
        assert!(!dispatcher.unregister(("event", "memory-change"), id));
        assert_eq!(dispatcher.dispatch(("event", "register-change"), Value::Null), 1);
        assert_eq!(dispatcher.dispatch(("event", "memory-change"), Value::Null), 0);
    }
}
