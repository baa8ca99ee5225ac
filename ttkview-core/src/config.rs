//! セッション設定

/// セッション設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// シンボル表を受け取ったとき、参照先のメモリを先読みする
    pub prefetch_symbols: bool,
    /// セッションへのコマンドキューの容量
    pub command_capacity: usize,
    /// 再構築するスタックの最大の深さ。超えた場合はビューを作り直す
    pub max_stack_depth: usize,
    /// 1回のプッシュで先読みするスタック値の最大数（スタックポインタ側から）
    pub stack_prefetch_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prefetch_symbols: true,
            command_capacity: 64,
            max_stack_depth: 65_536,
            stack_prefetch_limit: 256,
        }
    }
}

impl SessionConfig {
    /// シンボルの先読みを設定する
    pub fn prefetch_symbols(mut self, enabled: bool) -> Self {
        self.prefetch_symbols = enabled;
        self
    }

    /// コマンドキューの容量を設定する（最小1）
    pub fn command_capacity(mut self, capacity: usize) -> Self {
        self.command_capacity = capacity.max(1);
        self
    }

    /// スタックの最大の深さを設定する
    pub fn max_stack_depth(mut self, depth: usize) -> Self {
        self.max_stack_depth = depth;
        self
    }

    /// プッシュ時に先読みする値の最大数を設定する
    pub fn stack_prefetch_limit(mut self, limit: usize) -> Self {
        self.stack_prefetch_limit = limit;
        self
    }
}
