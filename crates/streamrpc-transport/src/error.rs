//! streamrpc-transport エラー型

/// トランスポート層のエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// トランスポートが閉じられている
    #[error("Transport closed")]
    Closed,
    /// 宛先ルートが解決できない
    #[error("No route for stream {0}")]
    NoRoute(String),
    /// RPC 呼び出しの失敗
    #[error("RPC call failed: {0}")]
    Rpc(String),
}
