//! HTTP/2 连接前导配置
//!
//! Akamai 类指纹读取的是新连接前三帧：SETTINGS（条目与顺序）、
//! 连接级 WINDOW_UPDATE 的增量、以及可选的 PRIORITY 帧序列。
//! 这里把三者与伪头顺序一起声明，并能直接产出前导字节用于基线校验。

/// HTTP/2 Setting ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum H2Setting {
    HeaderTableSize = 0x1,
    EnablePush = 0x2,
    MaxConcurrentStreams = 0x3,
    InitialWindowSize = 0x4,
    MaxFrameSize = 0x5,
    MaxHeaderListSize = 0x6,
    EnableConnectProtocol = 0x8,
    NoRfc7540Priorities = 0x9,
}

impl H2Setting {
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }
}

/// 伪头顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoHeader {
    Method,
    Scheme,
    Authority,
    Path,
}

impl PseudoHeader {
    pub fn as_str(&self) -> &'static str {
        match self {
            PseudoHeader::Method => ":method",
            PseudoHeader::Scheme => ":scheme",
            PseudoHeader::Authority => ":authority",
            PseudoHeader::Path => ":path",
        }
    }
}

/// 流优先级参数（HEADERS 帧携带或独立 PRIORITY 帧）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityParam {
    pub stream_dependency: u32,
    pub exclusive: bool,
    /// wire 值（发送时 +1 得到 1..=256 的真实权重）
    pub weight: u8,
}

/// 独立 PRIORITY 帧模板（Firefox 在连接建立时铺设优先级树）
#[derive(Debug, Clone, Copy)]
pub struct PriorityFrame {
    pub stream_id: u32,
    pub param: PriorityParam,
}

/// HTTP/2 指纹配置
#[derive(Debug, Clone)]
pub struct H2Spec {
    /// SETTINGS 条目，顺序即 wire 顺序
    pub settings: Vec<(u16, u32)>,
    /// 连接级 WINDOW_UPDATE 增量；0 表示不发送
    pub connection_window_update: u32,
    /// 连接建立时的 PRIORITY 帧序列
    pub priority_frames: Vec<PriorityFrame>,
    /// 每个请求流 HEADERS 上携带的优先级
    pub header_priority: Option<PriorityParam>,
    /// 伪头顺序
    pub pseudo_header_order: [PseudoHeader; 4],
}

impl H2Spec {
    /// HPACK 动态表大小（取 SETTINGS_HEADER_TABLE_SIZE，未声明则协议默认）
    pub fn header_table_size(&self) -> u32 {
        self.setting(H2Setting::HeaderTableSize).unwrap_or(4096)
    }

    pub fn initial_window_size(&self) -> u32 {
        self.setting(H2Setting::InitialWindowSize).unwrap_or(65535)
    }

    pub fn max_header_list_size(&self) -> Option<u32> {
        self.setting(H2Setting::MaxHeaderListSize)
    }

    pub fn max_concurrent_streams(&self) -> Option<u32> {
        self.setting(H2Setting::MaxConcurrentStreams)
    }

    pub fn enable_push(&self) -> bool {
        self.setting(H2Setting::EnablePush).map(|v| v != 0).unwrap_or(true)
    }

    fn setting(&self, id: H2Setting) -> Option<u32> {
        self.settings.iter().find(|(k, _)| *k == id.as_u16()).map(|(_, v)| *v)
    }

    /// 序列化连接前导帧（SETTINGS + WINDOW_UPDATE + PRIORITY*），
    /// 不含 24 字节 client preface 魔数。用于指纹基线校验。
    pub fn preamble_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);

        // SETTINGS: len(3) type=0x4 flags=0 stream=0
        let payload_len = self.settings.len() * 6;
        push_frame_header(&mut out, payload_len, 0x4, 0, 0);
        for (id, value) in &self.settings {
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&value.to_be_bytes());
        }

        if self.connection_window_update > 0 {
            push_frame_header(&mut out, 4, 0x8, 0, 0);
            out.extend_from_slice(&self.connection_window_update.to_be_bytes());
        }

        for pf in &self.priority_frames {
            push_frame_header(&mut out, 5, 0x2, 0, pf.stream_id);
            let mut dep = pf.param.stream_dependency;
            if pf.param.exclusive {
                dep |= 0x8000_0000;
            }
            out.extend_from_slice(&dep.to_be_bytes());
            out.push(pf.param.weight);
        }

        out
    }

    /// Akamai 风格指纹字符串：`S[;S]|WU|P|pseudo`
    pub fn akamai_fingerprint(&self) -> String {
        let settings = self
            .settings
            .iter()
            .map(|(id, v)| format!("{id}:{v}"))
            .collect::<Vec<_>>()
            .join(";");
        let prio = if self.priority_frames.is_empty() {
            "0".to_string()
        } else {
            self.priority_frames
                .iter()
                .map(|p| {
                    format!(
                        "{}:{}:{}:{}",
                        p.stream_id,
                        if p.param.exclusive { 1 } else { 0 },
                        p.param.stream_dependency,
                        p.param.weight as u16 + 1
                    )
                })
                .collect::<Vec<_>>()
                .join(",")
        };
        let pseudo = self
            .pseudo_header_order
            .iter()
            .map(|p| &p.as_str()[1..2])
            .collect::<Vec<_>>()
            .join(",");
        format!("{settings}|{}|{prio}|{pseudo}", self.connection_window_update)
    }
}

fn push_frame_header(out: &mut Vec<u8>, len: usize, frame_type: u8, flags: u8, stream_id: u32) {
    let len = len as u32;
    out.extend_from_slice(&len.to_be_bytes()[1..]);
    out.push(frame_type);
    out.push(flags);
    out.extend_from_slice(&stream_id.to_be_bytes());
}
