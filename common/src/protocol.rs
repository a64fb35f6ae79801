//! 通信プロトコル定義
//!
//! Router↔バックエンド間（OpenAI互換 chat completions）のメッセージ

use serde::{Deserialize, Serialize};

/// チャットメッセージ
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    /// ロール ("user", "assistant", "system")
    pub role: String,
    /// メッセージ内容
    pub content: String,
}

impl ChatMessage {
    /// userメッセージを生成
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// 推論リクエスト（バックエンドへそのまま転送する）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionRequest {
    /// モデルID
    pub model: String,
    /// メッセージ配列
    pub messages: Vec<ChatMessage>,
    /// 温度
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// 最大生成トークン数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// ストリーミング（Routerは非ストリーミングのみ扱う）
    #[serde(default)]
    pub stream: bool,
}

/// トークン使用量
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    /// 入力トークン数
    #[serde(default)]
    pub prompt_tokens: u32,
    /// 出力トークン数
    #[serde(default)]
    pub completion_tokens: u32,
    /// 合計トークン数
    #[serde(default)]
    pub total_tokens: u32,
}

/// 生成候補
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatChoice {
    /// 候補インデックス
    #[serde(default)]
    pub index: u32,
    /// 生成メッセージ
    pub message: ChatMessage,
    /// 終了理由
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// バックエンドからの推論レスポンス
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionResponse {
    /// レスポンスID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// 応答したモデル
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// 生成候補
    pub choices: Vec<ChatChoice>,
    /// トークン使用量
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}
