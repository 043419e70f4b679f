//! TLS 支持的组（椭圆曲线）常量
//!
//! 来源：https://www.iana.org/assignments/tls-parameters/tls-parameters.xhtml#tls-parameters-8

/// TLS 支持的组常量
#[allow(clippy::module_inception)]
pub mod supported_groups {
    // 椭圆曲线
    pub const SECP256R1: u16 = 0x0017; // 23
    pub const SECP384R1: u16 = 0x0018; // 24
    pub const SECP521R1: u16 = 0x0019; // 25
    pub const X25519: u16 = 0x001d; // 29
    pub const X448: u16 = 0x001e; // 30

    // 有限域 DH 组（Firefox 会在组列表尾部携带）
    pub const FFDHE2048: u16 = 0x0100;
    pub const FFDHE3072: u16 = 0x0101;

    // GREASE 占位
    pub const GREASE_PLACEHOLDER: u16 = 0x0a0a;
}

pub use supported_groups::*;

/// CurveID 类型别名
pub type CurveID = u16;

/// 常用别名
pub const CURVE_P256: u16 = supported_groups::SECP256R1;
pub const CURVE_P384: u16 = supported_groups::SECP384R1;
/// 后量子混合组（Chrome 131+ 的首选 key share）
pub const X25519_MLKEM768: u16 = 0x11ec;
