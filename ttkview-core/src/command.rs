//! REPLコマンド

/// REPLコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// プログラムファイルを読み込む
    Load(String),
    /// ステップ実行
    Step,
    /// 停止するまで実行
    Run,
    /// 実行中のプログラムを止める
    Halt,
    /// エンジンを作り直して読み込み直す
    Reset,
    /// レジスタ表示
    Registers,
    /// メモリ表示（アドレスまたはシンボル）
    Memory(String),
    /// スタック表示
    Stack,
    /// シンボル表示（正規表現で絞り込み）
    Symbols(Option<String>),
    /// アドレスを監視
    Watch(String),
    /// 監視を解除
    Unwatch(String),
    /// 監視中の値を表示
    Watches,
    /// プログラムの出力を表示
    Output,
    /// 実行状態を表示
    Status,
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        let (&name, args) = parts.split_first()?;
        let rest = (!args.is_empty()).then(|| args.join(" "));

        match name {
            "load" | "l" => rest.map(Command::Load),
            "step" | "s" => Some(Command::Step),
            "run" | "r" => Some(Command::Run),
            "halt" => Some(Command::Halt),
            "reset" | "stop" => Some(Command::Reset),
            "registers" | "regs" => Some(Command::Registers),
            "memory" | "mem" | "x" => rest.map(Command::Memory),
            "stack" | "bt" => Some(Command::Stack),
            "symbols" | "sym" => Some(Command::Symbols(rest)),
            "watch" | "w" => rest.map(Command::Watch),
            "unwatch" => rest.map(Command::Unwatch),
            "watches" => Some(Command::Watches),
            "output" | "out" => Some(Command::Output),
            "status" | "info" => Some(Command::Status),
            "help" | "h" | "?" => Some(Command::Help),
            "quit" | "q" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}
