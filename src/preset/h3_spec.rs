//! HTTP/3 / QUIC 指纹配置
//!
//! QUIC 传输参数、GREASE quic-bit、QPACK 容量与 H3 SETTINGS 一起
//! 构成 HTTP/3 侧的被动指纹面。数值在拨号时映射到 quinn 的
//! `TransportConfig`，同时保留原始值用于基线校验。

use std::time::Duration;

/// QUIC 传输参数（ClientHello 的 quic_transport_parameters 扩展内容）
#[derive(Debug, Clone)]
pub struct QuicTransportParams {
    pub max_idle_timeout: Duration,
    pub max_udp_payload_size: u16,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub active_connection_id_limit: u64,
    /// max_datagram_frame_size；None 表示不支持 HTTP Datagram
    pub max_datagram_frame_size: Option<u64>,
    /// 是否携带 grease_quic_bit 传输参数
    pub grease_quic_bit: bool,
}

/// HTTP/3 SETTINGS（控制流上发送）
#[derive(Debug, Clone)]
pub struct H3Settings {
    pub qpack_max_table_capacity: u64,
    pub qpack_blocked_streams: u64,
    /// SETTINGS_H3_DATAGRAM (0x33)
    pub h3_datagram: bool,
    /// 额外携带一个 GREASE setting（值按连接抽取）
    pub grease_setting: bool,
}

/// HTTP/3 指纹配置
#[derive(Debug, Clone)]
pub struct H3Spec {
    pub transport: QuicTransportParams,
    pub settings: H3Settings,
    /// Initial 包填充到的目标大小
    pub initial_packet_padding: usize,
}

impl H3Spec {
    /// 按 preset 填充 quinn 传输配置
    pub fn apply_transport(&self, t: &mut quinn::TransportConfig) {
        let p = &self.transport;
        t.max_idle_timeout(p.max_idle_timeout.try_into().ok());
        t.stream_receive_window(
            quinn::VarInt::from_u64(p.initial_max_stream_data_bidi_local)
                .unwrap_or(quinn::VarInt::MAX),
        );
        t.receive_window(quinn::VarInt::from_u64(p.initial_max_data).unwrap_or(quinn::VarInt::MAX));
        t.max_concurrent_bidi_streams(
            quinn::VarInt::from_u64(p.initial_max_streams_bidi).unwrap_or(quinn::VarInt::MAX),
        );
        t.max_concurrent_uni_streams(
            quinn::VarInt::from_u64(p.initial_max_streams_uni).unwrap_or(quinn::VarInt::MAX),
        );
        t.datagram_receive_buffer_size(
            p.max_datagram_frame_size.map(|v| v as usize * 64),
        );
        t.keep_alive_interval(Some(Duration::from_secs(10)));
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_chrome_h3_datagram_enabled() {
        let spec = crate::preset::lookup("chrome-143").unwrap();
        let h3 = spec.h3.as_ref().unwrap();
        assert!(h3.settings.h3_datagram);
        assert!(h3.transport.grease_quic_bit);
        assert!(h3.transport.max_datagram_frame_size.is_some());
    }

    #[test]
    fn test_initial_padding_positive() {
        let spec = crate::preset::lookup("chrome-143").unwrap();
        assert!(spec.h3.as_ref().unwrap().initial_packet_padding >= 1200);
    }
}
