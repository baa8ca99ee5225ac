//! スコープ付きリスナー
//!
//! 1つの名前空間に属するイベントを、名前ごとのハンドラ表に振り分けます。
//! ハンドラは構築時に明示的に登録します。

use crate::dispatcher::{Descriptor, Event, Subscriber};
use crate::errors::DispatchError;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

/// イベントハンドラ
pub type Handler<S> = fn(&mut S, &Value) -> Result<(), DispatchError>;

/// 名前空間を固定したハンドラ表
pub struct ScopedListener<S> {
    namespace: String,
    handlers: HashMap<String, Vec<Handler<S>>>,
}

impl<S> ScopedListener<S> {
    /// 新しいリスナーを作成する
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            handlers: HashMap::new(),
        }
    }

    /// ハンドラを追加する
    pub fn on(mut self, name: &str, handler: Handler<S>) -> Self {
        self.handlers
            .entry(name.to_string())
            .or_default()
            .push(handler);
        self
    }

    /// 名前空間
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// イベントを配送し、実行したハンドラの数を返す
    ///
    /// 名前空間が異なるイベントは無視します。名前は完全一致のみです。
    /// ハンドラがエラーを返しても後続のハンドラは実行されます。
    pub fn deliver(&self, state: &mut S, descriptor: &Descriptor, payload: &Value) -> usize {
        if descriptor.namespace != self.namespace {
            return 0;
        }
        let Some(handlers) = self.handlers.get(&descriptor.name) else {
            return 0;
        };

        for handler in handlers {
            if let Err(e) = handler(state, payload) {
                warn!(event = %descriptor, error = %e, "handler failed");
            }
        }
        handlers.len()
    }

    /// 状態と組み合わせてディスパッチャに登録できる形にする
    pub fn bind(self, state: S) -> BoundListener<S> {
        BoundListener {
            listener: self,
            state,
        }
    }
}

impl<S> fmt::Debug for ScopedListener<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("ScopedListener")
            .field("namespace", &self.namespace)
            .field("handlers", &names)
            .finish()
    }
}

/// 状態を所有するリスナー
pub struct BoundListener<S> {
    listener: ScopedListener<S>,
    state: S,
}

impl<S: Send> Subscriber for BoundListener<S> {
    fn on_event(&mut self, event: &Event) -> Result<(), DispatchError> {
        self.listener
            .deliver(&mut self.state, &event.descriptor, &event.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use serde_json::json;

    #[derive(Default)]
    struct Tally {
        seen: Vec<String>,
    }

    fn first(s: &mut Tally, v: &Value) -> Result<(), DispatchError> {
        s.seen.push(format!("first:{}", v));
        Ok(())
    }

    fn second(s: &mut Tally, _: &Value) -> Result<(), DispatchError> {
        s.seen.push("second".to_string());
        Ok(())
    }

    fn failing(_: &mut Tally, _: &Value) -> Result<(), DispatchError> {
        Err(DispatchError::Closed)
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let listener = ScopedListener::new("message")
            .on("output", first)
            .on("output", second);
        let mut tally = Tally::default();

        let ran = listener.deliver(&mut tally, &Descriptor::new("message", "output"), &json!(1));
        assert_eq!(ran, 2);
        assert_eq!(tally.seen, vec!["first:1", "second"]);
    }

    #[test]
    fn test_exact_name_only() {
        let listener = ScopedListener::new("message").on("output", first);
        let mut tally = Tally::default();

        assert_eq!(listener.deliver(&mut tally, &Descriptor::new("message", "*"), &json!(1)), 0);
        assert_eq!(listener.deliver(&mut tally, &Descriptor::new("event", "output"), &json!(1)), 0);
        assert!(tally.seen.is_empty());
    }

    #[test]
    fn test_failing_handler_does_not_stop_later_ones() {
        let listener = ScopedListener::new("event")
            .on("tick", failing)
            .on("tick", second);
        let mut tally = Tally::default();

        listener.deliver(&mut tally, &Descriptor::new("event", "tick"), &Value::Null);
        assert_eq!(tally.seen, vec!["second"]);
    }

    #[test]
    fn test_bound_listener_as_subscriber() {
        let bound = ScopedListener::new("event").on("tick", second).bind(Tally::default());
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(("event", "*"), bound);

        assert_eq!(dispatcher.dispatch(("event", "tick"), Value::Null), 1);
        assert_eq!(dispatcher.dispatch(("event", "tock"), Value::Null), 1);
    }
}
