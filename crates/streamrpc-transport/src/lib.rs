//! # streamrpc-transport
//!
//! ストリーム層と、その下の RPC 制御プレーンとの境界。
//!
//! RPC 層は個々のパケットをベストエフォートで届けるだけで、
//! 順序・重複排除・フロー制御は一切保証しない。
//! このクレートはその境界を次の部品で表す：
//!
//! - [`StreamRpc`]: 注入されるトランスポート（`StreamDataCommand` / `StreamDataAckCommand`）
//! - [`RouteOpts`]: 宛先ルートと「応答不要」フラグ
//! - [`WorkQueue`]: RPC 受信ループを止めないための非ブロッキング FIFO
//! - [`DeliveryPipe`]: 遅延・ゆらぎ・順序入れ替えを再現するプロセス内トランスポート
//!
//! ## パケットの流れ
//!
//! ```text
//! Writer.write → Broker.send_data → send キュー → StreamRpc.stream_data_command
//!        ~~~ RPC（順不同・重複あり）~~~
//! Broker.recv_data → recv キュー → Reader.recv_data → Reader.read が起きる
//! ```

pub mod error;
pub mod pipe;
pub mod queue;
pub mod rpc;

pub use error::TransportError;
pub use pipe::{DeliveryConfig, DeliveryPipe, DeliveryStats, PipeRpc};
pub use queue::WorkQueue;
pub use rpc::{RouteOpts, StreamRpc};
