//! GREASE 值抽取
//!
//! preset 只声明 GREASE 的*位置*，具体值在每条连接建立时从会话种子
//! 派生的伪随机源中抽取。指纹工具匹配的是位置而非数值，
//! 但真实浏览器每次连接的 GREASE 值都会变化，这里保持同样的行为。

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// RFC 8701 定义的 16 个 GREASE 值（低字节与高字节相同，形如 0xNaNa）
pub const TLS_GREASE_VALUES: [u16; 16] = [
    0x0a0a, 0x1a1a, 0x2a2a, 0x3a3a, 0x4a4a, 0x5a5a, 0x6a6a, 0x7a7a, 0x8a8a, 0x9a9a, 0xaaaa,
    0xbaba, 0xcaca, 0xdada, 0xeaea, 0xfafa,
];

/// 判断一个 u16 是否为 GREASE 值
pub fn is_grease_value(v: u16) -> bool {
    (v & 0x0f0f) == 0x0a0a && (v >> 8) == (v & 0xff)
}

/// 单条连接内的 GREASE 抽取器
///
/// Chrome 的行为：同一个 ClientHello 内密码套件与第一个 GREASE 扩展
/// 使用不同值，第二个 GREASE 扩展再换一个值，组列表复用套件的值。
#[derive(Debug)]
pub struct GreaseDraw {
    rng: StdRng,
    cipher: Option<u16>,
    group: Option<u16>,
}

impl GreaseDraw {
    /// 从会话种子与连接序号派生
    pub fn new(session_seed: u64, conn_seq: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(session_seed.wrapping_mul(0x9e3779b97f4a7c15) ^ conn_seq),
            cipher: None,
            group: None,
        }
    }

    fn pick(&mut self) -> u16 {
        TLS_GREASE_VALUES[self.rng.gen_range(0..TLS_GREASE_VALUES.len())]
    }

    /// 密码套件位置的 GREASE 值（连接内稳定）
    pub fn cipher_suite(&mut self) -> u16 {
        if self.cipher.is_none() {
            self.cipher = Some(self.pick());
        }
        self.cipher.unwrap()
    }

    /// 命名组位置的 GREASE 值（连接内稳定，与套件值不同）
    pub fn named_group(&mut self) -> u16 {
        if self.group.is_none() {
            let c = self.cipher_suite();
            let mut g = self.pick();
            while g == c {
                g = self.pick();
            }
            self.group = Some(g);
        }
        self.group.unwrap()
    }

    /// 扩展位置的 GREASE 值（每次调用抽新值）
    pub fn extension(&mut self) -> u16 {
        self.pick()
    }

    /// QUIC 传输参数位置的 GREASE id（31*N+27 形式）
    pub fn quic_transport_parameter(&mut self) -> u64 {
        31u64 * self.rng.gen_range(0u64..1 << 20) + 27
    }
}
