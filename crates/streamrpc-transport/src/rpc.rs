//! 注入トランスポートのインターフェース

use streamrpc_proto::{AckPacket, DataPacket};

use crate::error::TransportError;

/// RPC 呼び出しのルーティングオプション
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteOpts {
    /// 宛先ルート ID
    pub route: String,
    /// 応答を待たない（fire-and-forget）
    pub no_response: bool,
}

impl RouteOpts {
    /// 応答不要の送信オプション。ストリームのパケットは常にこれで送る。
    pub fn fire_and_forget(route: &str) -> Self {
        RouteOpts {
            route: route.to_string(),
            no_response: true,
        }
    }
}

/// ストリームのパケットを相手プロセスへ運ぶ RPC トランスポート
///
/// 実装は「いつか・順不同で・重複ありで」相手の `Broker::recv_data` /
/// `Broker::recv_ack` に届ければよい。Broker の送信ワーカースレッドから呼ばれる。
pub trait StreamRpc: Send + Sync {
    /// データパケットを送る
    fn stream_data_command(&self, data: DataPacket, opts: &RouteOpts) -> Result<(), TransportError>;

    /// ACK パケットを送る
    fn stream_data_ack_command(&self, ack: AckPacket, opts: &RouteOpts) -> Result<(), TransportError>;
}

impl<T: StreamRpc + ?Sized> StreamRpc for std::sync::Arc<T> {
    fn stream_data_command(&self, data: DataPacket, opts: &RouteOpts) -> Result<(), TransportError> {
        (**self).stream_data_command(data, opts)
    }

    fn stream_data_ack_command(&self, ack: AckPacket, opts: &RouteOpts) -> Result<(), TransportError> {
        (**self).stream_data_ack_command(ack, opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fire_and_forget() {
        let opts = RouteOpts::fire_and_forget("conn:1");
        assert_eq!(opts.route, "conn:1");
        assert!(opts.no_response);
    }
}
