//! ワイヤプロトコル
//!
//! コントローラとエンジンの間でやり取りされるメッセージの形式を定義します。
//! 1行に1つのJSONオブジェクトを送ります。
//!
//! - リクエスト: `{"id": 3, "type": "readAddress", "payload": {"address": 100}}`
//! - レスポンス: `{"id": 3, "payload": {"address": 100, "value": 7}}`
//! - 通知: `{"type": "output", "output": [3], "registers": [...], "line": 4}`
//!
//! IDを持つのはリクエストとレスポンスだけで、通知（イベント）はIDを持ちません。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// リクエストID（チャネルの生存期間中に単調増加し、再利用されない）
pub type RequestId = u64;

/// TTK-91の1ワード
pub type Word = i32;

/// メモリアドレス（レジスタ値としてやり取りされるため符号付き）
pub type Address = i32;

/// ワーカー（プロトコル）由来のメッセージの名前空間
pub const MESSAGE_NAMESPACE: &str = "message";

/// エンジン由来のイベントの名前空間
pub const EVENT_NAMESPACE: &str = "event";

/// コントローラからエンジンへのリクエスト種別
pub mod request {
    pub const LOAD: &str = "load";
    pub const RUN: &str = "run";
    pub const STEP: &str = "step";
    pub const STOP: &str = "stop";
    pub const READ_ADDRESS: &str = "readAddress";
    /// 順序バリア。空のレスポンスが返る
    pub const SYNC: &str = "sync";
}

/// エンジンからコントローラへの通知種別
pub mod message {
    pub const SET_REGISTERS: &str = "setRegisters";
    pub const SET_SYMBOL_TABLE: &str = "setSymbolTable";
    pub const OUTPUT: &str = "output";
    pub const UPDATE_STACK_POINTER: &str = "updateStackPointer";
    pub const EVENT: &str = "event";
    pub const ADDRESS_RESPONSE: &str = "addressResponse";
}

/// `event` 通知に含まれるエンジンイベントの種別
pub mod event {
    pub const REGISTER_CHANGE: &str = "register-change";
    pub const MEMORY_CHANGE: &str = "memory-change";
    /// プログラムの読み込み失敗
    pub const ERROR: &str = "error";
    /// 実行時トラップ
    pub const TRAP: &str = "trap";
    /// 未知のリクエスト種別を受け取った
    pub const PROTOCOL_ERROR: &str = "protocol-error";
}

/// コントローラからエンジンへのリクエスト
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Request {
    /// 新しいリクエストを作成する
    pub fn new(id: RequestId, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id,
            kind: kind.into(),
            payload,
        }
    }

    /// ペイロードを型付きで取り出す
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.payload)
    }
}

/// リクエストに対するレスポンス
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    #[serde(default)]
    pub payload: Value,
}

impl Response {
    /// ペイロードを型付きで取り出す
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.payload)
    }
}

/// IDを持たない通知
///
/// ワーカーが送るのと同じく、`type` 以外のフィールドはフラットに並びます。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Notification {
    /// シリアライズ可能な値から通知を作成する
    ///
    /// 値がオブジェクトでない場合は `value` フィールドに格納します。
    pub fn new<T: Serialize>(kind: impl Into<String>, body: &T) -> serde_json::Result<Self> {
        let body = match serde_json::to_value(body)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Ok(Self {
            kind: kind.into(),
            body,
        })
    }

    /// 本文をペイロード値として取得する
    pub fn payload(&self) -> Value {
        Value::Object(self.body.clone())
    }
}

/// エンジンからコントローラへ届くメッセージ
///
/// `id` を持つものはレスポンス、持たないものは通知として分類されます。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Incoming {
    Response(Response),
    Notification(Notification),
}

impl Incoming {
    /// レスポンスを作成する
    pub fn response<T: Serialize>(id: RequestId, payload: &T) -> serde_json::Result<Self> {
        Ok(Incoming::Response(Response {
            id,
            payload: serde_json::to_value(payload)?,
        }))
    }

    /// 通知を作成する
    pub fn notification<T: Serialize>(kind: &str, body: &T) -> serde_json::Result<Self> {
        Ok(Incoming::Notification(Notification::new(kind, body)?))
    }
}

/// `load` リクエストのペイロード
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadPayload {
    pub program: String,
}

/// `readAddress` リクエストのペイロード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadAddressPayload {
    pub address: Address,
}

/// `readAddress` のレスポンス、および `addressResponse` 通知
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressValue {
    pub address: Address,
    pub value: Word,
}

/// リクエストが失敗したときのレスポンス
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}

/// `output` 通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMessage {
    /// 実行開始からプログラムが出力したすべての値
    pub output: Vec<Word>,
    #[serde(default)]
    pub registers: Vec<Word>,
    pub line: u32,
    #[serde(default)]
    pub halted: bool,
}

/// `setRegisters` 通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetRegistersMessage {
    pub registers: Vec<Word>,
}

/// `setSymbolTable` 通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetSymbolTableMessage {
    pub symbols: BTreeMap<String, Address>,
}

/// `updateStackPointer` 通知
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStackPointerMessage {
    pub address: Address,
}

/// `event` 通知（エンジンイベントの包み）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// `register-change` イベント
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterChange {
    pub register: usize,
    #[serde(alias = "data")]
    pub value: Word,
}

/// `memory-change` イベント
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryChange {
    pub address: Address,
    #[serde(alias = "data")]
    pub value: Word,
}

/// `protocol-error` イベント
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolErrorPayload {
    pub request_type: String,
    pub message: String,
}
