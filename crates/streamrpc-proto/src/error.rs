//! streamrpc-proto エラー型

use alloc::string::String;

/// パケットのエンコード/デコードのエラー
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtoError {
    /// data64 フィールドの Base64 デコードに失敗
    #[error("Invalid Base64 payload")]
    InvalidBase64,
    /// JSON のエンコード/デコードに失敗
    #[error("JSON codec failed: {0}")]
    JsonFailed(String),
    /// Protobuf デコード失敗
    #[error("Proto decode failed: {0}")]
    DecodeFailed(prost::DecodeError),
}

impl From<serde_json::Error> for ProtoError {
    fn from(err: serde_json::Error) -> Self {
        ProtoError::JsonFailed(alloc::format!("{}", err))
    }
}
