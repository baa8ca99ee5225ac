//! メモリウォッチャーのテスト

mod support;

use serde_json::json;
use std::time::Duration;
use support::{manual_session_with, session, settle, within};
use ttkview_core::{DispatchError, Event, SessionConfig};
use ttkview_target::{Incoming, Notification};

const PROGRAM: &str = "count DC 7\nLOAD R1,=9\nSTORE R1,count\nADD R1,=1\nSTORE R1,count\nSVC SP,=HALT\n";

#[tokio::test]
async fn test_watcher_follows_memory_changes() {
    let session = session();

    within(async {
        session.load(PROGRAM).await.unwrap();
        settle(&session).await;

        let watcher = session.watcher().await.unwrap();
        assert_eq!(watcher.watch(1000).await.unwrap(), 7);
        assert_eq!(watcher.get(1000), Some(7));

        session.step().await.unwrap();
        session.step().await.unwrap();
        settle(&session).await;
        assert_eq!(watcher.get(1000), Some(9));

        // 監視をやめても共有キャッシュは更新され続ける
        assert!(watcher.unwatch(1000).await.unwrap());
        session.step().await.unwrap();
        session.step().await.unwrap();
        settle(&session).await;
        assert_eq!(watcher.get(1000), None);
        assert_eq!(session.snapshot().await.unwrap().memory.get(1000), Some(10));

        watcher.destroy().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_watch_fetches_uncached_address() {
    let session = session();

    within(async {
        session.load(PROGRAM).await.unwrap();
        settle(&session).await;
        assert_eq!(session.snapshot().await.unwrap().memory.get(2000), None);

        let watcher = session.watcher().await.unwrap();
        assert_eq!(watcher.watch(2000).await.unwrap(), 0);
        assert_eq!(watcher.addresses(), vec![2000]);
        assert_eq!(session.snapshot().await.unwrap().memory.get(2000), Some(0));

        watcher.destroy().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_destroyed_watcher_is_unregistered() {
    let session = session();

    within(async {
        let watcher = session.watcher().await.unwrap();
        let id = watcher.id();
        watcher.destroy().await.unwrap();

        // すでに登録が解除されている
        assert!(!session.unsubscribe(id).await.unwrap());
    })
    .await;
}

#[tokio::test]
async fn test_dropped_watcher_is_unregistered() {
    let session = session();

    within(async {
        let watcher = session.watcher().await.unwrap();
        let id = watcher.id();
        drop(watcher);

        // ドロップ時の解除はコマンドキューを通るので、後続のコマンドより先に処理される
        assert!(!session.unsubscribe(id).await.unwrap());
    })
    .await;
}

#[tokio::test]
async fn test_watchers_survive_reload() {
    let session = session();

    within(async {
        session.load(PROGRAM).await.unwrap();
        settle(&session).await;

        let watcher = session.watcher().await.unwrap();
        watcher.watch(1000).await.unwrap();

        session.step().await.unwrap();
        session.step().await.unwrap();
        settle(&session).await;
        assert_eq!(watcher.get(1000), Some(9));

        // 読み込み直すと初期値に戻る
        session.load(PROGRAM).await.unwrap();
        settle(&session).await;
        assert_eq!(watcher.values().get(&1000), Some(&7));

        watcher.destroy().await.unwrap();
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watcher_dropped_with_full_queue_is_unregistered() {
    let (session, remotes) = manual_session_with(SessionConfig::default().command_capacity(1));

    within(async {
        // 購読者の中でセッションのタスクを止めておく
        let (entered_tx, entered_rx) = std::sync::mpsc::channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        session
            .subscribe_with(("message", "busy"), move |_: &Event| -> Result<(), DispatchError> {
                let _ = entered_tx.send(());
                let _ = release_rx.recv();
                Ok(())
            })
            .await
            .unwrap();

        let watcher = session.watcher().await.unwrap();
        let id = watcher.id();

        let notification = Notification::new("busy", &json!({})).unwrap();
        remotes.lock().unwrap()[0]
            .incoming
            .send(Incoming::Notification(notification))
            .unwrap();
        tokio::task::spawn_blocking(move || entered_rx.recv())
            .await
            .unwrap()
            .unwrap();

        // コマンドキューを埋める
        let filler = tokio::spawn({
            let session = session.clone();
            async move { session.snapshot().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        drop(watcher);
        tokio::time::sleep(Duration::from_millis(50)).await;
        release_tx.send(()).unwrap();

        filler.await.unwrap().unwrap();
        assert!(!session.unsubscribe(id).await.unwrap());
    })
    .await;
}
