//! レジスタバンク

use crate::protocol::Word;
use serde::{Deserialize, Serialize};

/// 作業レジスタの数（R0〜R7）
pub const REGISTER_COUNT: usize = 8;

/// スタックポインタとして使われるレジスタのインデックス（SP = R7）
pub const STACK_POINTER_REGISTER: usize = 7;

/// 8本の作業レジスタ
///
/// 長さは常に [`REGISTER_COUNT`] に固定されます。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterBank([Word; REGISTER_COUNT]);

impl RegisterBank {
    /// すべて0のレジスタバンクを作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// スライスからレジスタバンクを作成する
    ///
    /// 足りない分は0で埋め、余った分は捨てます。
    pub fn from_slice(values: &[Word]) -> Self {
        let mut bank = Self::default();
        for (slot, value) in bank.0.iter_mut().zip(values) {
            *slot = *value;
        }
        bank
    }

    /// レジスタを読み取る
    pub fn get(&self, index: usize) -> Option<Word> {
        self.0.get(index).copied()
    }

    /// レジスタに書き込み、以前の値を返す
    pub fn set(&mut self, index: usize, value: Word) -> Option<Word> {
        let slot = self.0.get_mut(index)?;
        Some(std::mem::replace(slot, value))
    }

    /// スタックポインタ（R7）を取得する
    pub fn stack_pointer(&self) -> Word {
        self.0[STACK_POINTER_REGISTER]
    }

    /// すべてのレジスタを0に戻す
    pub fn clear(&mut self) {
        self.0 = [0; REGISTER_COUNT];
    }

    /// 全レジスタの値を取得する
    pub fn as_slice(&self) -> &[Word] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_slice_pads_and_truncates() {
        let short = RegisterBank::from_slice(&[1, 2]);
        assert_eq!(short.as_slice(), &[1, 2, 0, 0, 0, 0, 0, 0]);

        let long = RegisterBank::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(long.stack_pointer(), 8);
        assert_eq!(long.as_slice().len(), REGISTER_COUNT);
    }

    #[test]
    fn test_set_returns_previous_value() {
        let mut bank = RegisterBank::new();
        assert_eq!(bank.set(STACK_POINTER_REGISTER, 2048), Some(0));
        assert_eq!(bank.set(STACK_POINTER_REGISTER, 2047), Some(2048));
        assert_eq!(bank.set(REGISTER_COUNT, 1), None);
    }
}
