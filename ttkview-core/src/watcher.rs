//! メモリウォッチャー
//!
//! 特定のアドレスの値を監視し、`memory-change` イベントのたびに
//! ウォッチャー自身のビューを更新します。

use crate::dispatcher::SubscriberId;
use crate::errors::{DispatchError, ProxyError};
use crate::listener::{BoundListener, ScopedListener};
use crate::session::SessionHandle;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;
use ttkview_target::{event, Address, MemoryChange, Word, EVENT_NAMESPACE};

/// ウォッチャーが公開するビュー
pub type WatchView = BTreeMap<Address, Word>;

/// ディスパッチャに登録されるウォッチャーの状態
pub(crate) struct WatchState {
    view: Arc<watch::Sender<WatchView>>,
}

impl WatchState {
    /// 監視中のアドレスだけを更新する
    fn on_memory_change(&mut self, payload: &Value) -> Result<(), DispatchError> {
        let change = MemoryChange::deserialize(payload)?;
        self.view.send_if_modified(|view| match view.get_mut(&change.address) {
            Some(value) if *value != change.value => {
                *value = change.value;
                true
            }
            _ => false,
        });
        Ok(())
    }
}

/// ウォッチャー用の購読者を作成する
pub(crate) fn watch_listener(view: Arc<watch::Sender<WatchView>>) -> BoundListener<WatchState> {
    ScopedListener::new(EVENT_NAMESPACE)
        .on(event::MEMORY_CHANGE, WatchState::on_memory_change)
        .bind(WatchState { view })
}

/// メモリウォッチャー
///
/// 使い終わったら [`MemoryWatcher::destroy`] を呼んでください。
/// 破棄せずにドロップした場合も登録は解除されますが、警告が記録されます。
#[derive(Debug)]
pub struct MemoryWatcher {
    id: SubscriberId,
    session: SessionHandle,
    view: watch::Receiver<WatchView>,
    destroyed: bool,
}

impl MemoryWatcher {
    pub(crate) fn new(id: SubscriberId, session: SessionHandle, view: watch::Receiver<WatchView>) -> Self {
        Self {
            id,
            session,
            view,
            destroyed: false,
        }
    }

    /// ディスパッチャ上のID
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// アドレスの監視を開始し、現在の値を返す
    ///
    /// キャッシュにない場合はエンジンから読み出します。
    pub async fn watch(&self, address: Address) -> Result<Word, ProxyError> {
        self.session.watch(self.id, address).await
    }

    /// アドレスの監視をやめる。共有のメモリキャッシュには影響しない
    pub async fn unwatch(&self, address: Address) -> Result<bool, ProxyError> {
        self.session.unwatch(self.id, address).await
    }

    /// 監視中のアドレスの値
    pub fn get(&self, address: Address) -> Option<Word> {
        self.view.borrow().get(&address).copied()
    }

    /// 監視中のアドレス
    pub fn addresses(&self) -> Vec<Address> {
        self.view.borrow().keys().copied().collect()
    }

    /// ビューの現在の内容
    pub fn values(&self) -> WatchView {
        self.view.borrow().clone()
    }

    /// ビューの変更を待つための受信口
    pub fn subscribe(&self) -> watch::Receiver<WatchView> {
        self.view.clone()
    }

    /// 次の変更まで待つ
    pub async fn changed(&mut self) -> Result<WatchView, ProxyError> {
        self.view
            .changed()
            .await
            .map_err(|_| ProxyError::UnknownWatcher(self.id))?;
        Ok(self.view.borrow_and_update().clone())
    }

    /// ディスパッチャから登録を解除する
    pub async fn destroy(mut self) -> Result<(), ProxyError> {
        self.destroyed = true;
        self.session.remove_watcher(self.id).await
    }
}

impl Drop for MemoryWatcher {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        warn!(watcher = %self.id, "memory watcher dropped without destroy");
        self.session.forget_watcher(self.id);
    }
}
