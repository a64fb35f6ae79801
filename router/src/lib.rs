//! Fleet Router Server
//!
//! 複数のLLM推論バックエンドへリクエストを振り分けるゲートウェイ

#![warn(missing_docs)]

/// REST APIハンドラー
pub mod api;

/// ロードバランサー（選択戦略とアドミッション制御）
pub mod balancer;

/// 推論クライアント（バックエンド呼び出しと再試行）
pub mod client;

/// ヘルスプローブ
pub mod health;

/// バックエンドレジストリ
pub mod registry;

/// バックエンドプロセス監視
pub mod supervisor;

/// フリートモニター（メトリクスとアラート）
pub mod monitor;

/// 推論ゲートウェイ（各コンポーネントの組み立て）
pub mod gateway;

/// ロギング初期化ユーティリティ
pub mod logging;

/// 設定管理（環境変数ヘルパーと設定ファイル）
pub mod config;

/// CLIインターフェース
pub mod cli;

use std::path::PathBuf;
use std::sync::Arc;

/// アプリケーション状態
#[derive(Clone)]
pub struct AppState {
    /// 推論ゲートウェイ
    pub gateway: Arc<gateway::Gateway>,
    /// リロード元の設定ファイル
    pub config_path: Option<PathBuf>,
}
