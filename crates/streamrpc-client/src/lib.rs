//! # streamrpc-client
//!
//! 信頼性のない RPC の上に、順序保証・フロー制御付きのバイトストリームを載せる。
//!
//! RPC 層はパケットを順不同・重複ありでしか届けないので、
//! このクレートがユーザーレベルで次を実装する：
//!
//! - 順序の復元と重複排除（[`Reader`]）
//! - ウィンドウによるフロー制御（[`Writer`] が `rwnd` を超えて送らない）
//! - 正常終了（Eof / Fin）と中断（Cancel）
//! - ストリーム ID ごとの振り分けと、RPC ループを止めない非同期ディスパッチ（[`Broker`]）
//!
//! ## パケットのやり取り
//!
//! ```text
//!   Writer 側 Broker                          Reader 側 Broker
//!   ────────────────                          ────────────────
//!   Data{seq=0, data}      ──────────────→    Reader に取り込み
//!                          ←──────────────    Ack{seq=next_seq, rwnd}
//!   Data{seq=n, eof}       ──────────────→    EOF
//!                          ←──────────────    Ack{fin}
//!
//!   Reader.close()         ←──────────────    Ack{cancel}
//! ```
//!
//! `seq` はパケット番号ではなくバイトオフセット。

mod cancel;
mod config;
mod error;
mod id;

pub mod broker;
pub mod reader;
pub mod writer;

pub use broker::{Broker, StreamState, StreamWriter, IDLE_TIMEOUT_REASON, READER_NOT_FOUND};
pub use cancel::CancelToken;
pub use config::BrokerConfig;
pub use error::StreamError;
pub use id::new_stream_id;
pub use reader::{AckSender, Reader};
pub use writer::{AckState, DataSender, WindowState, Writer};

pub use streamrpc_proto::{AckPacket, DataPacket, StreamMeta};

/// "stream reader not found" 中断 ACK の最短送信間隔（ストリーム ID ごと、ミリ秒）
pub const DEFAULT_NOT_FOUND_ACK_INTERVAL_MS: u64 = 1000;

/// 終了したストリームのルートを保持する時間（ミリ秒）
pub const DEFAULT_RETIRED_TTL_MS: u64 = 30_000;

/// 順不同バッファ上限のデフォルト倍率（rwnd × この値）
pub const DEFAULT_OOO_WINDOW_MULTIPLE: i64 = 4;

/// ウィンドウ更新 ACK のしきい値 = read_window / この値
///
/// 1 バイト読むたびに ACK しないためのヒステリシス。
pub const ACK_HYSTERESIS_DIVISOR: i64 = 5;
