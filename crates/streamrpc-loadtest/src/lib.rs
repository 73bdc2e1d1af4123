//! # streamrpc-loadtest
//!
//! ストリーム層の端から端までの負荷試験。
//!
//! 2 つの Broker を遅延・ゆらぎ付きの `DeliveryPipe` でつなぎ、
//! 一方の Writer から決まったパターンを大量に書いて、
//! もう一方の Reader で 1 バイトずつ照合する。
//!
//! ```text
//! $ stream-loadtest --size 1048576 --delay-ms 5 --skew-ms 3 --window-size 16384
//! ```
//!
//! skew を入れるとパケットが入れ替わるので、並べ替え・重複排除・
//! ウィンドウ制御・Fin までの終了手順をまとめて確かめられる。

pub mod run;
pub mod verify;

pub use run::{run, LoadConfig, LoadError, LoadReport};
pub use verify::{fill_pattern, pattern_byte, SlowReader, Verifier};
