//! メモリキャッシュ

use std::collections::BTreeMap;
use ttkview_target::{Address, Word};

/// エンジンのメモリの疎なキャッシュ
///
/// エンジンから受け取った値だけを保持します。
/// クリアされるのはプログラムの読み込み時とリセット時のみです。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryCache {
    cells: BTreeMap<Address, Word>,
}

impl MemoryCache {
    /// 空のキャッシュを作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// アドレスの値を取得する
    pub fn get(&self, address: Address) -> Option<Word> {
        self.cells.get(&address).copied()
    }

    /// 値を書き込み、以前の値を返す
    pub fn insert(&mut self, address: Address, value: Word) -> Option<Word> {
        self.cells.insert(address, value)
    }

    /// アドレスがキャッシュされているか
    pub fn contains(&self, address: Address) -> bool {
        self.cells.contains_key(&address)
    }

    /// キャッシュを空にする
    pub fn clear(&mut self) {
        self.cells.clear();
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// アドレス順に走査する
    pub fn iter(&self) -> impl Iterator<Item = (Address, Word)> + '_ {
        self.cells.iter().map(|(a, v)| (*a, *v))
    }
}
