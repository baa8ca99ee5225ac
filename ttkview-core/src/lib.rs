//! ttkview のコア機能
//!
//! このクレートは、隔離されたコンテキストで動く実行エンジンの状態を
//! クライアント側にミラーする非同期の同期レイヤを提供します。
//! イベントディスパッチャ、メッセージチャネル、状態プロキシ、スタック再構築、
//! メモリウォッチャー、それらを1つのタスクで動かすセッションを含みます。

pub mod channel;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod listener;
pub mod memory;
pub mod proxy;
pub mod session;
pub mod stack;
pub mod state;
pub mod watcher;

pub use channel::{MessageChannel, Pending, Responder, ResponseFuture, Routed};
pub use command::Command;
pub use config::SessionConfig;
pub use dispatcher::{Descriptor, Dispatcher, Event, Forwarder, Subscriber, SubscriberId};
pub use errors::{ChannelError, DispatchError, ProxyError};
pub use listener::{BoundListener, Handler, ScopedListener};
pub use memory::MemoryCache;
pub use proxy::{announce, ReadReply, Reply, StateProxy, PROXY_NAMESPACE};
pub use session::{Session, SessionHandle};
pub use stack::{StackChange, StackMeta, StackView};
pub use state::{Mirror, Phase};
pub use watcher::{MemoryWatcher, WatchView};

// 他のクレートから使用するために再エクスポート
pub use ttkview_target::{Address, Connector, RegisterBank, Word, STACK_POINTER_REGISTER};

/// セッション操作の結果型
pub type Result<T> = std::result::Result<T, ProxyError>;
