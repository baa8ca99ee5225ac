//! ttkview ターゲット（エンジン）側の機能
//!
//! このクレートは、隔離されたコンテキストで動作する実行エンジンとの通信に必要な
//! 低レベル機能を提供します。
//! ワイヤプロトコルの型、エンジン契約トレイト、エンジンホストのループ、
//! リモートコンテキストを生成・破棄するコネクタなどを含みます。

pub mod engine;
pub mod host;
pub mod link;
pub mod process;
pub mod protocol;
pub mod registers;

pub use engine::{Engine, EngineCallback, EngineEvent, EngineFactory, EngineFault, StepOutcome};
pub use host::{EngineHost, Outbox};
pub use link::{Connector, EngineLink, InProcessConnector, LinkSender};
pub use process::{serve_stdio, ProcessConnector};
pub use protocol::{
    event, message, request, Address, AddressValue, ErrorPayload, EventMessage, Incoming,
    LoadPayload, MemoryChange, Notification, OutputMessage, ProtocolErrorPayload,
    ReadAddressPayload, RegisterChange, Request, RequestId, Response, SetRegistersMessage,
    SetSymbolTableMessage, UpdateStackPointerMessage, Word, EVENT_NAMESPACE, MESSAGE_NAMESPACE,
};
pub use registers::{RegisterBank, REGISTER_COUNT, STACK_POINTER_REGISTER};

use thiserror::Error;

/// ホスト・トランスポート層のエラー
#[derive(Debug, Error)]
pub enum HostError {
    /// エンジンプロセスの起動に失敗した
    #[error("Failed to spawn engine process '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// 子プロセスの標準入出力を取得できなかった
    #[error("Engine process has no {0} pipe")]
    MissingPipe(&'static str),

    /// エンジンスレッドの起動に失敗した
    #[error("Failed to start engine thread: {0}")]
    Thread(#[source] std::io::Error),

    /// 入出力エラー
    #[error("Communication error: {0}")]
    Io(#[from] std::io::Error),

    /// シリアライズエラー
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// ターゲット制御の結果型
pub type Result<T> = std::result::Result<T, HostError>;
