//! ストリーム ID の生成
//!
//! ID は独立に生成された Broker 同士で衝突してはならないので、
//! プロセス内カウンタではなく UUID v4 を使う。

use uuid::Uuid;

/// UUID v4 形式のストリーム ID を生成する
///
/// ```text
/// 3f2b8c1e-9d4a-4f6b-8e2c-7a1d5b9c0e3f
/// ```
pub fn new_stream_id() -> String {
    Uuid::new_v4().to_string()
}
