//! エンジン状態のミラー

use crate::memory::MemoryCache;
use crate::stack::StackView;
use std::collections::BTreeMap;
use std::fmt;
use ttkview_target::{Address, RegisterBank, Word};

/// プログラムの実行段階
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Unloaded,
    /// 読み込みを要求し、エンジンの応答を待っている
    Loading,
    Loaded,
    Running,
    Stepped,
    Halted,
}

impl Phase {
    /// プログラムが読み込まれているか
    pub fn is_loaded(self) -> bool {
        !matches!(self, Phase::Unloaded | Phase::Loading)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Unloaded => "unloaded",
            Phase::Loading => "loading",
            Phase::Loaded => "loaded",
            Phase::Running => "running",
            Phase::Stepped => "stepped",
            Phase::Halted => "halted",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// エンジン状態のローカルコピー
///
/// 状態プロキシだけが変更します。読み手にはスナップショットとして渡します。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mirror {
    pub registers: RegisterBank,
    pub memory: MemoryCache,
    pub symbols: BTreeMap<String, Address>,
    pub stack: StackView,
    /// プログラムが出力したすべての値
    pub output: Vec<Word>,
    /// 現在の実行行（1始まり）
    pub line: u32,
    pub phase: Phase,
    /// エンジンが最後に報告した障害
    pub fault: Option<String>,
    /// 最後に読み込んだプログラム
    pub source: Option<String>,
}

impl Default for Mirror {
    fn default() -> Self {
        Self {
            registers: RegisterBank::new(),
            memory: MemoryCache::new(),
            symbols: BTreeMap::new(),
            stack: StackView::new(),
            output: Vec::new(),
            line: 1,
            phase: Phase::Unloaded,
            fault: None,
            source: None,
        }
    }
}

impl Mirror {
    /// 新しいミラーを作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// 読み込み済みのプログラム以外の状態を初期化する
    pub fn clear(&mut self) {
        let source = self.source.take();
        *self = Self {
            source,
            ..Self::default()
        };
    }

    /// スタックポインタ
    pub fn stack_pointer(&self) -> Address {
        self.registers.stack_pointer()
    }

    /// シンボルのアドレスとキャッシュ済みの値
    pub fn symbol_value(&self, name: &str) -> Option<(Address, Option<Word>)> {
        let address = *self.symbols.get(name)?;
        Some((address, self.memory.get(address)))
    }
}
