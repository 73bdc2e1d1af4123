//! Broker の設定

use std::time::Duration;

use serde::Deserialize;

use crate::error::StreamError;
use crate::{DEFAULT_NOT_FOUND_ACK_INTERVAL_MS, DEFAULT_OOO_WINDOW_MULTIPLE, DEFAULT_RETIRED_TTL_MS};

/// Broker の設定
///
/// JSON から読み込める。省略したフィールドはデフォルト値になる。
///
/// ```json
/// { "idle_timeout_ms": 60000, "ooo_window_multiple": null }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// 未知ストリームへの "stream reader not found" 中断 ACK の最短送信間隔（ストリーム ID ごと、ミリ秒）
    pub not_found_ack_interval_ms: u64,
    /// 終了したストリームのルートを保持する時間（ミリ秒）。遅れて届く ACK の転送に使う
    pub retired_ttl_ms: u64,
    /// 順不同バッファの上限 = rwnd × この値。`None` なら無制限
    pub ooo_window_multiple: Option<i64>,
    /// この時間トラフィックのないストリームを破棄する（ミリ秒）。`None` なら破棄しない
    pub idle_timeout_ms: Option<u64>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            not_found_ack_interval_ms: DEFAULT_NOT_FOUND_ACK_INTERVAL_MS,
            retired_ttl_ms: DEFAULT_RETIRED_TTL_MS,
            ooo_window_multiple: Some(DEFAULT_OOO_WINDOW_MULTIPLE),
            idle_timeout_ms: None,
        }
    }
}

impl BrokerConfig {
    /// JSON 文字列から設定を読み込む
    pub fn from_json(json: &str) -> Result<Self, StreamError> {
        serde_json::from_str(json).map_err(|e| StreamError::Config(e.to_string()))
    }

    pub fn not_found_ack_interval(&self) -> Duration {
        Duration::from_millis(self.not_found_ack_interval_ms)
    }

    pub fn retired_ttl(&self) -> Duration {
        Duration::from_millis(self.retired_ttl_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    /// ウィンドウ `rwnd` の Reader に適用する順不同バッファ上限（バイト）
    pub fn ooo_limit(&self, rwnd: i64) -> Option<usize> {
        self.ooo_window_multiple
            .map(|m| rwnd.max(0).saturating_mul(m.max(1)) as usize)
    }
}
