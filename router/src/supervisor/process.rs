//! 外部プロセスの起動・停止
//!
//! Supervisor は [`ProcessLauncher`] だけに依存するので、
//! テストでは実プロセスの代わりに偽実装を注入できる。

use async_trait::async_trait;
use fleet_router_common::{
    error::{GatewayError, GatewayResult},
    types::BackendDescriptor,
};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// 停止要求後、終了を待つ最大時間
const STOP_GRACE: Duration = Duration::from_secs(10);

/// プロセス終了情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// 終了コード（シグナル終了時は None）
    pub code: Option<i32>,
}

impl ProcessExit {
    /// 正常終了か
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// プロセス操作の能力インターフェース
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// プロセスを起動し、PIDを返す
    async fn start(&self, descriptor: &BackendDescriptor) -> GatewayResult<u32>;
    /// プロセスを停止し、終了を待つ
    async fn stop(&self, name: &str) -> GatewayResult<()>;
    /// プロセスが生存しているか
    async fn is_alive(&self, name: &str) -> bool;
    /// プロセスの終了を待つ
    async fn wait(&self, name: &str) -> GatewayResult<ProcessExit>;
}

struct ChildHandle {
    pid: u32,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

/// 終了通知を待つ
async fn wait_exit(
    mut exit_rx: watch::Receiver<Option<ProcessExit>>,
) -> GatewayResult<ProcessExit> {
    loop {
        if let Some(exit) = exit_rx.borrow().clone() {
            return Ok(exit);
        }
        exit_rx
            .changed()
            .await
            .map_err(|_| GatewayError::Process("process watcher ended without exit status".into()))?;
    }
}

/// `tokio::process` による実装
///
/// 子プロセスは監視タスクが所有し、停止要求は oneshot、終了通知は watch で受け渡す。
#[derive(Default)]
pub struct CommandLauncher {
    children: Mutex<HashMap<String, ChildHandle>>,
}

impl CommandLauncher {
    /// 新しいランチャー
    pub fn new() -> Self {
        Self::default()
    }

    fn children(&self) -> MutexGuard<'_, HashMap<String, ChildHandle>> {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn exit_receiver(&self, name: &str) -> GatewayResult<watch::Receiver<Option<ProcessExit>>> {
        self.children()
            .get(name)
            .map(|handle| handle.exit_rx.clone())
            .ok_or_else(|| GatewayError::Process(format!("no process started for {}", name)))
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn start(&self, descriptor: &BackendDescriptor) -> GatewayResult<u32> {
        let launch = descriptor.launch.as_ref().ok_or_else(|| {
            GatewayError::Process(format!(
                "backend {} has no launch configuration",
                descriptor.name
            ))
        })?;

        let mut command = Command::new(&launch.command);
        command
            .args(&launch.args)
            .envs(&launch.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &launch.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            GatewayError::Process(format!("failed to spawn {}: {}", launch.command, e))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| GatewayError::Process("spawned process has no pid".into()))?;

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);
        let name = descriptor.name.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        warn!(backend = %name, "Failed to kill process: {}", e);
                    }
                    child.wait().await
                }
            };
            let exit = match status {
                Ok(status) => ProcessExit {
                    code: status.code(),
                },
                Err(e) => {
                    warn!(backend = %name, "Failed to wait for process: {}", e);
                    ProcessExit { code: None }
                }
            };
            debug!(backend = %name, pid, code = ?exit.code, "Process exited");
            let _ = exit_tx.send(Some(exit));
        });

        let previous = self.children().insert(
            descriptor.name.clone(),
            ChildHandle {
                pid,
                kill_tx: Some(kill_tx),
                exit_rx,
            },
        );
        if let Some(mut previous) = previous {
            // 置き換えた古いプロセスは停止させる
            if let Some(tx) = previous.kill_tx.take() {
                let _ = tx.send(());
            }
        }

        info!(backend = %descriptor.name, pid, command = %launch.command, "Process started");
        Ok(pid)
    }

    async fn stop(&self, name: &str) -> GatewayResult<()> {
        let (pid, kill_tx, exit_rx) = {
            let mut children = self.children();
            let Some(handle) = children.get_mut(name) else {
                return Ok(());
            };
            (handle.pid, handle.kill_tx.take(), handle.exit_rx.clone())
        };

        if let Some(tx) = kill_tx {
            let _ = tx.send(());
        }
        match tokio::time::timeout(STOP_GRACE, wait_exit(exit_rx)).await {
            Ok(result) => {
                result?;
            }
            Err(_) => {
                return Err(GatewayError::Process(format!(
                    "process {} ({}) did not exit within {}s",
                    name,
                    pid,
                    STOP_GRACE.as_secs()
                )))
            }
        }

        self.children().remove(name);
        info!(backend = %name, pid, "Process stopped");
        Ok(())
    }

    async fn is_alive(&self, name: &str) -> bool {
        self.children()
            .get(name)
            .map(|handle| handle.exit_rx.borrow().is_none())
            .unwrap_or(false)
    }

    async fn wait(&self, name: &str) -> GatewayResult<ProcessExit> {
        let exit_rx = self.exit_receiver(name)?;
        wait_exit(exit_rx).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use fleet_router_common::types::LaunchSpec;

    fn descriptor(command: &str, args: &[&str]) -> BackendDescriptor {
        let mut descriptor = BackendDescriptor::new("proc", "127.0.0.1", 18080, "llama");
        descriptor.launch = Some(LaunchSpec {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: Default::default(),
            working_dir: None,
        });
        descriptor
    }

    #[tokio::test]
    async fn test_start_and_stop_long_running_process() {
        let launcher = CommandLauncher::new();
        let pid = launcher.start(&descriptor("sleep", &["30"])).await.unwrap();
        assert!(pid > 0);
        assert!(launcher.is_alive("proc").await);

        launcher.stop("proc").await.unwrap();
        assert!(!launcher.is_alive("proc").await);
    }

    #[tokio::test]
    async fn test_wait_reports_exit_code() {
        let launcher = CommandLauncher::new();
        launcher
            .start(&descriptor("sh", &["-c", "exit 3"]))
            .await
            .unwrap();
        let exit = launcher.wait("proc").await.unwrap();
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());
        assert!(!launcher.is_alive("proc").await);
    }

    #[tokio::test]
    async fn test_start_without_launch_spec_fails() {
        let launcher = CommandLauncher::new();
        let descriptor = BackendDescriptor::new("plain", "127.0.0.1", 8000, "llama");
        assert!(matches!(
            launcher.start(&descriptor).await,
            Err(GatewayError::Process(_))
        ));
        assert!(launcher.wait("plain").await.is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let launcher = CommandLauncher::new();
        let result = launcher
            .start(&descriptor("/nonexistent/fleet-backend", &[]))
            .await;
        assert!(result.is_err());
        assert!(!launcher.is_alive("proc").await);
    }
}
