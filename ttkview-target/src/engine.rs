//! エンジン契約
//!
//! 命令を実際に実行するエンジンは外部の協力者です。
//! ここではホストがエンジンに要求する最小限のインターフェースだけを定義します。

use crate::protocol::{Address, Word};
use crate::registers::RegisterBank;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// エンジンが発行するイベント（`register-change`、`memory-change` など）
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub kind: String,
    pub payload: Value,
}

impl EngineEvent {
    /// 新しいイベントを作成する
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// イベントリスナーのコールバック
pub type EngineCallback = Box<dyn FnMut(&EngineEvent) + Send>;

/// 1命令実行した結果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    /// 実行開始からの出力すべて
    pub output: Vec<Word>,
    /// 現在の実行行
    pub line: u32,
    /// プログラムが停止したか
    pub halted: bool,
}

/// エンジン側の障害（不正なプログラム、実行時トラップ）
///
/// 例外ではなく通常のイベントとしてコントローラに報告されます。
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct EngineFault {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl EngineFault {
    /// 新しい障害を作成する
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
        }
    }

    /// 行番号を付ける
    pub fn at_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }
}

/// 読み込み済みプログラムを実行するエンジンのハンドル
pub trait Engine: Send {
    /// 1命令実行する
    fn step(&mut self) -> Result<StepOutcome, EngineFault>;

    /// 全レジスタのスナップショットを取得する
    fn registers(&self) -> RegisterBank;

    /// メモリを読み取る
    fn read_address(&self, address: Address) -> Result<Word, EngineFault>;

    /// シンボルテーブルを取得する
    fn symbol_table(&self) -> BTreeMap<String, Address>;

    /// イベントリスナーを登録する
    ///
    /// `pattern` はイベント種別、または `*`（すべて）です。
    fn add_listener(&mut self, pattern: &str, callback: EngineCallback);

    /// スタックポインタを取得する
    fn stack_pointer(&self) -> Word {
        self.registers().stack_pointer()
    }
}

/// ソースコードからエンジンを生成するファクトリ
pub trait EngineFactory: Send + 'static {
    type Engine: Engine;

    /// プログラムを読み込んだエンジンを作成する
    fn create(&self, source: &str) -> Result<Self::Engine, EngineFault>;
}
