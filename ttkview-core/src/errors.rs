//! エラー型

use crate::dispatcher::{Descriptor, SubscriberId};
use thiserror::Error;
use ttkview_target::HostError;

/// メッセージチャネルのエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// チャネルがリセットされ、保留中のリクエストが破棄された
    #[error("engine restarted")]
    EngineRestarted,

    /// リモートコンテキストが終了している
    #[error("engine disconnected")]
    Disconnected,

    /// セッションが終了している
    #[error("session closed")]
    SessionClosed,
}

/// リスナーへの配送時のエラー
#[derive(Debug, Error)]
pub enum DispatchError {
    /// ペイロードを解釈できなかった
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// 値が範囲外など、ペイロードの内容が不正
    #[error("invalid payload for {descriptor}: {reason}")]
    Invalid { descriptor: Descriptor, reason: String },

    /// 購読者側が閉じている
    #[error("subscriber closed")]
    Closed,
}

/// 状態プロキシのエラー
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// プログラムが読み込まれていない
    #[error("no program loaded")]
    NotLoaded,

    /// リモートコンテキストへの接続に失敗した
    #[error("failed to connect to engine: {0}")]
    Connect(#[from] HostError),

    /// エンジンがリクエストの失敗を報告した
    #[error("engine error: {0}")]
    Remote(String),

    /// 登録されていないウォッチャー
    #[error("unknown watcher {0}")]
    UnknownWatcher(SubscriberId),
}

impl ProxyError {
    /// チャネルのリセットによって破棄されたか
    pub fn is_restart(&self) -> bool {
        matches!(self, ProxyError::Channel(ChannelError::EngineRestarted))
    }
}
