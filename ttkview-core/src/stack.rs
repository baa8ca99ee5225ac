//! スタック再構築
//!
//! スタックポインタの変化からプッシュ・ポップを導出し、
//! スタック領域 `(SP, base]` のメモリを値の列として保持します。
//! 先頭（インデックス0）がベースアドレスの値です。

use crate::memory::MemoryCache;
use std::collections::BTreeMap;
use tracing::{debug, warn};
use ttkview_target::{Address, Word};

/// スタック上の値のメタデータ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackMeta {
    /// プッシュされたときの実行行
    pub pushed_on_line: u32,
}

/// スタックポインタ変化の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackChange {
    Unchanged,
    /// 値が追加された。`missing` はキャッシュになかったアドレス
    Pushed { count: usize, missing: Vec<Address> },
    Popped { count: usize },
    /// スタックポインタがベースを超えたため、ビューを作り直した
    Rebased { from: Address, to: Address },
}

/// スタックビュー
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackView {
    base: Option<Address>,
    /// `None` は値の取得待ち
    slots: Vec<Option<Word>>,
    metadata: BTreeMap<Address, StackMeta>,
}

impl StackView {
    /// 空のビューを作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// ベースアドレス（最初に観測したスタックポインタ）
    pub fn base(&self) -> Option<Address> {
        self.base
    }

    /// ベースが未設定なら設定する
    pub fn anchor(&mut self, sp: Address) -> bool {
        if self.base.is_some() {
            return false;
        }
        self.base = Some(sp);
        true
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// スタック上の値（ベース側から）
    pub fn slots(&self) -> &[Option<Word>] {
        &self.slots
    }

    /// アドレスのメタデータ
    pub fn metadata(&self, address: Address) -> Option<&StackMeta> {
        self.metadata.get(&address)
    }

    /// 全メタデータ
    pub fn all_metadata(&self) -> &BTreeMap<Address, StackMeta> {
        &self.metadata
    }

    /// 取得待ちの値がないか
    pub fn is_consistent(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// インデックスに対応するアドレス
    pub fn address_of(&self, index: usize) -> Option<Address> {
        let base = self.base?;
        let index = Address::try_from(index).ok()?;
        Some(base - index)
    }

    /// (アドレス, 値) をベース側から走査する
    pub fn entries(&self) -> impl Iterator<Item = (Address, Option<Word>)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, v)| Some((self.address_of(i)?, *v)))
    }

    /// ビューとベースを破棄する
    pub fn clear(&mut self) {
        self.base = None;
        self.slots.clear();
        self.metadata.clear();
    }

    /// スタックポインタの変化 (old → new) をビューに反映する
    ///
    /// ベースより上、またはベースから `max_depth` より深い位置に移動した場合は
    /// ビューを破棄して新しいスタックポインタをベースにします。
    pub fn reconstruct(
        &mut self,
        old: Address,
        new: Address,
        line: u32,
        memory: &MemoryCache,
        max_depth: usize,
    ) -> StackChange {
        let Some(base) = self.base else {
            self.base = Some(new);
            return StackChange::Unchanged;
        };

        let depth = i64::from(base) - i64::from(new);
        if depth < 0 || depth > max_depth as i64 {
            if depth < 0 {
                warn!(base, sp = new, "stack pointer moved above stack base, rebasing");
            } else {
                warn!(base, sp = new, max_depth, "stack pointer moved beyond stack limit, rebasing");
            }
            self.rebase(new);
            return StackChange::Rebased { from: base, to: new };
        }

        // 現在のビューの先端（ベースから深さ len の位置）
        let top = base - self.slots.len() as Address;
        if new < top {
            let before = self.slots.len();
            let mut missing = Vec::new();
            for address in ((new + 1)..=top).rev() {
                let value = memory.get(address);
                if value.is_none() {
                    missing.push(address);
                }
                self.slots.push(value);
                self.metadata.insert(address, StackMeta { pushed_on_line: line });
            }
            StackChange::Pushed {
                count: self.slots.len() - before,
                missing,
            }
        } else if new > top {
            let count = (new - top) as usize;
            self.metadata.retain(|&address, _| address > new);
            self.slots.truncate(self.slots.len() - count);
            StackChange::Popped { count }
        } else {
            if old != new {
                debug!(old, new, "stack view already matches stack pointer");
            }
            StackChange::Unchanged
        }
    }

    fn rebase(&mut self, base: Address) {
        self.slots.clear();
        self.metadata.clear();
        self.base = Some(base);
    }

    /// スタック領域 `(sp, base]` への書き込みをビューに反映する
    pub fn mirror(&mut self, address: Address, value: Word, sp: Address) -> bool {
        let Some(base) = self.base else {
            return false;
        };
        if address <= sp || address > base {
            return false;
        }

        let index = (base - address) as usize;
        match self.slots.get_mut(index) {
            Some(slot) => {
                *slot = Some(value);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPTH: usize = 1024;

    fn memory(cells: &[(Address, Word)]) -> MemoryCache {
        let mut cache = MemoryCache::new();
        for (a, v) in cells {
            cache.insert(*a, *v);
        }
        cache
    }

    fn anchored(base: Address) -> StackView {
        let mut view = StackView::new();
        view.anchor(base);
        view
    }

    #[test]
    fn test_first_change_anchors_base() {
        let mut view = StackView::new();
        assert_eq!(view.reconstruct(0, 2048, 1, &MemoryCache::new(), DEPTH), StackChange::Unchanged);
        assert_eq!(view.base(), Some(2048));
        assert!(view.is_empty());
    }

    #[test]
    fn test_push_appends_cached_values() {
        let mem = memory(&[(2048, 5), (2047, 6)]);
        let mut view = anchored(2048);

        let change = view.reconstruct(2048, 2046, 3, &mem, DEPTH);
        assert_eq!(change, StackChange::Pushed { count: 2, missing: vec![] });
        assert_eq!(view.slots(), &[Some(5), Some(6)]);
        assert_eq!(view.metadata(2047), Some(&StackMeta { pushed_on_line: 3 }));
        assert!(view.is_consistent());
    }

    #[test]
    fn test_push_of_uncached_address_is_pending() {
        let mut view = anchored(2048);

        let change = view.reconstruct(2048, 2047, 1, &MemoryCache::new(), DEPTH);
        assert_eq!(change, StackChange::Pushed { count: 1, missing: vec![2048] });
        assert!(!view.is_consistent());

        assert!(view.mirror(2048, 9, 2047));
        assert!(view.is_consistent());
        assert_eq!(view.slots(), &[Some(9)]);
    }

    #[test]
    fn test_push_then_pop_restores_view() {
        let mem = memory(&[(2048, 1), (2047, 2), (2046, 3), (2045, 4)]);
        let mut view = anchored(2048);
        view.reconstruct(2048, 2046, 1, &mem, DEPTH);
        let before = view.clone();

        view.reconstruct(2046, 2044, 2, &mem, DEPTH);
        assert_eq!(view.len(), 4);
        view.reconstruct(2044, 2046, 3, &mem, DEPTH);

        assert_eq!(view, before);
    }

    #[test]
    fn test_length_tracks_stack_pointer() {
        let mem = MemoryCache::new();
        let mut view = anchored(100);
        let mut sp = 100;
        for next in [97, 99, 90, 95, 100, 98] {
            view.reconstruct(sp, next, 1, &mem, DEPTH);
            sp = next;
            assert_eq!(view.len() as Address, 100 - sp);
        }
    }

    #[test]
    fn test_pointer_above_base_rebases() {
        let mem = memory(&[(100, 1)]);
        let mut view = anchored(100);
        view.reconstruct(100, 99, 1, &mem, DEPTH);

        let change = view.reconstruct(99, 104, 2, &mem, DEPTH);
        assert_eq!(change, StackChange::Rebased { from: 100, to: 104 });
        assert_eq!(view.base(), Some(104));
        assert!(view.is_empty());
        assert!(view.all_metadata().is_empty());
    }

    #[test]
    fn test_mirror_ignores_addresses_outside_stack() {
        let mem = memory(&[(100, 1)]);
        let mut view = anchored(100);
        view.reconstruct(100, 99, 1, &mem, DEPTH);

        assert!(!view.mirror(99, 7, 99));
        assert!(!view.mirror(101, 7, 99));
        assert_eq!(view.slots(), &[Some(1)]);
    }

    #[test]
    fn test_pointer_beyond_limit_rebases() {
        let mut view = anchored(2048);
        view.reconstruct(2048, 2047, 1, &MemoryCache::new(), DEPTH);

        let change = view.reconstruct(2047, -5_000_000, 2, &MemoryCache::new(), DEPTH);
        assert_eq!(change, StackChange::Rebased { from: 2048, to: -5_000_000 });
        assert_eq!(view.base(), Some(-5_000_000));
        assert!(view.is_empty());
        assert!(view.all_metadata().is_empty());

        // 限界ちょうどまでは通常のプッシュ
        let mut view = anchored(0);
        let change = view.reconstruct(0, -(DEPTH as Address), 1, &MemoryCache::new(), DEPTH);
        assert!(matches!(change, StackChange::Pushed { count, .. } if count == DEPTH));
    }

    #[test]
    fn test_extreme_pointer_values_do_not_overflow() {
        let mut view = anchored(Address::MAX);
        let change = view.reconstruct(Address::MAX, Address::MIN, 1, &MemoryCache::new(), DEPTH);
        assert_eq!(change, StackChange::Rebased { from: Address::MAX, to: Address::MIN });

        let change = view.reconstruct(Address::MIN, Address::MAX, 2, &MemoryCache::new(), DEPTH);
        assert_eq!(change, StackChange::Rebased { from: Address::MIN, to: Address::MAX });
    }
}
