//! ストリームのエラー型

use std::io;

use streamrpc_proto::ProtoError;

/// Reader / Writer / Broker のエラー
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamError {
    /// 閉じたストリームへの読み書き
    #[error("io: read/write on closed pipe")]
    ClosedPipe,
    /// 相手側 Writer がエラーで終了した
    #[error("stream error: {0}")]
    Remote(String),
    /// 相手側 Reader が中断した
    #[error("stream cancelled")]
    Cancelled,
    /// ペイロードのデコード失敗
    #[error("payload decode failed: {0}")]
    Decode(#[from] ProtoError),
    /// 順不同バッファが上限を超えた
    #[error("out-of-order buffer overflow: {buffered} bytes buffered, limit {limit}")]
    ReorderOverflow { buffered: usize, limit: usize },
    /// 一定時間トラフィックがなかった
    #[error("stream idle timeout")]
    IdleTimeout,
    /// 同じストリーム ID に Writer が二重登録された
    #[error("writer already registered for stream id {0}")]
    WriterAlreadyRegistered(String),
    /// Broker のワーカースレッド起動失敗
    #[error("failed to start broker worker: {0}")]
    Spawn(String),
    /// Broker は既に閉じられている
    #[error("broker closed")]
    BrokerClosed,
    /// 設定の読み込み失敗
    #[error("invalid broker config: {0}")]
    Config(String),
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        let kind = match &err {
            StreamError::ClosedPipe => io::ErrorKind::BrokenPipe,
            StreamError::Decode(_) => io::ErrorKind::InvalidData,
            StreamError::Cancelled => io::ErrorKind::ConnectionAborted,
            StreamError::IdleTimeout => io::ErrorKind::TimedOut,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(StreamError::Cancelled.to_string(), "stream cancelled");
        assert_eq!(
            StreamError::Remote("unexpected EOF".into()).to_string(),
            "stream error: unexpected EOF"
        );
    }

    #[test]
    fn test_io_error_kind() {
        let err: io::Error = StreamError::ClosedPipe.into();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        let err: io::Error = StreamError::Decode(ProtoError::InvalidBase64).into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
