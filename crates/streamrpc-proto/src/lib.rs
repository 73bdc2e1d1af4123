//! # streamrpc-proto
//!
//! ストリームのパケット定義とエンコード/デコードユーティリティ。
//!
//! ## パケットの役割
//!
//! 一本の論理ストリームは、次の 2 種類のパケットで RPC 上を運ばれる：
//! - `DataPacket`: Writer → Reader。`seq` はペイロード先頭バイトのオフセット
//! - `AckPacket`: Reader → Writer。`seq` は Reader が受理済みの累積オフセット、
//!   `rwnd` は Reader の現在の空きバッファ量
//!
//! `StreamMeta` はストリーム作成時に一度だけ帯域外で交換され、
//! 双方の Broker がパケットの転送先ルートを解決するのに使う。
//!
//! ## Wire Format
//!
//! RPC 層では JSON で運ばれる（ペイロードは `data64` に Base64 で格納）。
//! 同じ型は `prost::Message` も実装しており、バイナリ表現も取れる。
//!
//! ```text
//! {"id":"6f1c…","seq":1024,"data64":"aGVsbG8=","eof":true}
//! {"id":"6f1c…","seq":1029,"fin":true,"rwnd":65536}
//! ```

#![no_std]
extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

pub mod error;

pub use error::ProtoError;

fn is_false(b: &bool) -> bool {
    !*b
}

/// Writer → Reader のデータパケット
///
/// エラーパケット（`error` が非空）は `seq` が有効でなくてもよい。
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct DataPacket {
    /// ストリーム ID
    #[prost(string, tag = "1")]
    pub id: String,
    /// `data64` の先頭バイトのバイトオフセット
    #[prost(int64, tag = "2")]
    pub seq: i64,
    /// Base64 エンコード済みペイロード（空可）
    #[prost(string, tag = "3")]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub data64: String,
    /// このパケットでストリームが終端する
    #[prost(bool, tag = "4")]
    #[serde(skip_serializing_if = "is_false")]
    pub eof: bool,
    /// 送信側で発生したエラー（非空ならストリームは異常終了）
    #[prost(string, tag = "5")]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Reader → Writer の ACK パケット
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct AckPacket {
    /// ストリーム ID
    #[prost(string, tag = "1")]
    pub id: String,
    /// Reader が受理済みの累積バイトオフセット（Reader の nextSeq）
    #[prost(int64, tag = "2")]
    pub seq: i64,
    /// 正常終了の確認（Eof パケットと対）
    #[prost(bool, tag = "3")]
    #[serde(skip_serializing_if = "is_false")]
    pub fin: bool,
    /// 中断。Writer は送信をやめ、ストリームをエラー扱いにする
    #[prost(bool, tag = "4")]
    #[serde(skip_serializing_if = "is_false")]
    pub cancel: bool,
    /// Reader の現在の空きバッファ量
    #[prost(int64, tag = "5")]
    pub rwnd: i64,
    /// 中断理由など
    #[prost(string, tag = "6")]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// ストリーム作成時に帯域外で交換するメタデータ
#[derive(Clone, PartialEq, Eq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamMeta {
    /// ストリーム ID
    #[prost(string, tag = "1")]
    pub id: String,
    /// 初期ウィンドウ
    #[prost(int64, tag = "2")]
    pub rwnd: i64,
    /// Reader 側のルート ID
    #[prost(string, tag = "3")]
    #[serde(rename = "readerrouteid")]
    pub reader_route_id: String,
    /// Writer 側のルート ID
    #[prost(string, tag = "4")]
    #[serde(rename = "writerrouteid")]
    pub writer_route_id: String,
}

impl DataPacket {
    /// ペイロード付きのデータパケットを組み立てる
    pub fn with_data(id: &str, seq: i64, data: &[u8]) -> Self {
        DataPacket {
            id: id.into(),
            seq,
            data64: if data.is_empty() {
                String::new()
            } else {
                base64::engine::general_purpose::STANDARD.encode(data)
            },
            eof: false,
            error: String::new(),
        }
    }

    /// 終端（Eof）パケット
    pub fn eof(id: &str, seq: i64) -> Self {
        DataPacket {
            id: id.into(),
            seq,
            eof: true,
            ..Default::default()
        }
    }

    /// エラー終端パケット
    pub fn error(id: &str, seq: i64, msg: &str) -> Self {
        DataPacket {
            id: id.into(),
            seq,
            error: msg.into(),
            ..Default::default()
        }
    }

    /// エラーパケットか
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    /// data64 をデコードする（空の場合は空の Vec）
    ///
    /// # エラー
    /// - `ProtoError::InvalidBase64`: Base64 として不正
    pub fn decode_data(&self) -> Result<Vec<u8>, ProtoError> {
        if self.data64.is_empty() {
            return Ok(Vec::new());
        }
        base64::engine::general_purpose::STANDARD
            .decode(&self.data64)
            .map_err(|_| ProtoError::InvalidBase64)
    }

    /// デコード後のペイロード長の上限（Base64 長からの見積もり）
    pub fn estimated_len(&self) -> usize {
        self.data64.len() / 4 * 3
    }
}

impl AckPacket {
    /// 中断 ACK を組み立てる
    pub fn cancel(id: &str, seq: i64, reason: &str) -> Self {
        AckPacket {
            id: id.into(),
            seq,
            cancel: true,
            error: reason.into(),
            ..Default::default()
        }
    }

    /// Fin または Cancel（ストリームを終わらせる ACK）か
    pub fn is_terminal(&self) -> bool {
        self.fin || self.cancel
    }
}

/// JSON / Protobuf 変換をまとめたトレイト
///
/// 3 つのパケット型すべてに実装される。
pub trait Packet: prost::Message + Serialize + for<'de> Deserialize<'de> + Default + Sized {
    /// JSON にエンコードする
    fn to_json(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// JSON からデコードする
    fn from_json(bytes: &[u8]) -> Result<Self, ProtoError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Protobuf バイト列にエンコードする
    fn encode_to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Protobuf バイト列からデコードする
    ///
    /// # エラー
    /// - `ProtoError::DecodeFailed`: protobuf デコード失敗
    fn decode_from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        Self::decode(bytes).map_err(ProtoError::DecodeFailed)
    }
}

impl Packet for DataPacket {}
impl Packet for AckPacket {}
impl Packet for StreamMeta {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_packet_payload_roundtrip() {
        let pkt = DataPacket::with_data("s1", 10, b"hello");
        assert_eq!(pkt.data64, "aGVsbG8=");
        assert_eq!(pkt.decode_data().unwrap(), b"hello");
        assert!(!pkt.is_error());
    }

    #[test]
    fn test_empty_payload_is_omitted() {
        let pkt = DataPacket::with_data("s1", 0, b"");
        assert!(pkt.data64.is_empty());
        assert!(pkt.decode_data().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let pkt = DataPacket {
            id: "s1".into(),
            data64: "not base64!!".into(),
            ..Default::default()
        };
        assert_eq!(pkt.decode_data(), Err(ProtoError::InvalidBase64));
    }

    #[test]
    fn test_json_field_names() {
        let pkt = DataPacket::eof("abc", 42);
        let json = pkt.to_json().unwrap();
        assert_eq!(json, br#"{"id":"abc","seq":42,"eof":true}"#);

        let ack = AckPacket::cancel("abc", 7, "stream reader not found");
        let json = ack.to_json().unwrap();
        assert_eq!(
            json,
            br#"{"id":"abc","seq":7,"cancel":true,"rwnd":0,"error":"stream reader not found"}"#
        );
    }

    #[test]
    fn test_json_missing_fields_default() {
        // RPC 層は空フィールドを省略して送ってくる
        let ack = AckPacket::from_json(br#"{"id":"x","seq":5,"rwnd":100}"#).unwrap();
        assert_eq!(ack.seq, 5);
        assert_eq!(ack.rwnd, 100);
        assert!(!ack.is_terminal());
    }

    #[test]
    fn test_stream_meta_json() {
        let meta = StreamMeta {
            id: "m".into(),
            rwnd: 1024,
            reader_route_id: "reader1".into(),
            writer_route_id: "writer1".into(),
        };
        let json = meta.to_json().unwrap();
        let decoded = StreamMeta::from_json(&json).unwrap();
        assert_eq!(decoded, meta);
        assert!(core::str::from_utf8(&json).unwrap().contains(r#""readerrouteid":"reader1""#));
    }

    #[test]
    fn test_proto_encoding_keeps_terminal_flags() {
        let ack = AckPacket {
            id: "p".into(),
            seq: 99,
            fin: true,
            rwnd: 12,
            ..Default::default()
        };
        let decoded = AckPacket::decode_from_bytes(&ack.encode_to_bytes()).unwrap();
        assert!(decoded.fin);
        assert!(decoded.is_terminal());
        assert_eq!(decoded.rwnd, 12);
    }

    #[test]
    fn test_proto_decode_garbage_fails() {
        let result = DataPacket::decode_from_bytes(&[0xFF, 0xFF, 0xFF]);
        assert!(matches!(result, Err(ProtoError::DecodeFailed(_))));
    }
}
