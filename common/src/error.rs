//! エラー型定義
//!
//! 統一エラー型（thiserror使用）

use thiserror::Error;

/// Common layer error type
#[derive(Debug, Error)]
pub enum CommonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Gateway error type
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Common layer error
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Backend not found
    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    /// No eligible backend for the model
    #[error("No available backends for model {model}")]
    NoBackendAvailable {
        /// 対象モデルID
        model: String,
    },

    /// Backend process error
    #[error("Process error: {0}")]
    Process(String),

    /// Backend did not become healthy within the start timeout
    #[error("Backend {name} did not become healthy within {secs}s")]
    StartTimeout {
        /// バックエンド名
        name: String,
        /// 起動待ちタイムアウト（秒）
        secs: u64,
    },

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    Http(String),
}

impl GatewayError {
    /// 設定エラーを生成するヘルパー
    pub fn config(message: impl Into<String>) -> Self {
        GatewayError::Common(CommonError::Config(message.into()))
    }
}

/// Result type alias (Common)
pub type CommonResult<T> = Result<T, CommonError>;

/// Result type alias (Gateway)
pub type GatewayResult<T> = Result<T, GatewayError>;
