//! TLS 签名方案常量
//!
//! 来源：https://www.iana.org/assignments/tls-parameters/tls-signaturescheme.csv

/// TLS 签名方案常量
#[allow(clippy::module_inception)]
pub mod signature_schemes {
    // RSA PKCS1
    pub const RSA_PKCS1_SHA1: u16 = 0x0201;
    pub const RSA_PKCS1_SHA256: u16 = 0x0401;
    pub const RSA_PKCS1_SHA384: u16 = 0x0501;
    pub const RSA_PKCS1_SHA512: u16 = 0x0601;

    // RSA PSS
    pub const RSA_PSS_RSAE_SHA256: u16 = 0x0804;
    pub const RSA_PSS_RSAE_SHA384: u16 = 0x0805;
    pub const RSA_PSS_RSAE_SHA512: u16 = 0x0806;

    // ECDSA
    pub const ECDSA_SHA1: u16 = 0x0203;
    pub const ECDSA_WITH_P256_AND_SHA256: u16 = 0x0403;
    pub const ECDSA_WITH_P384_AND_SHA384: u16 = 0x0503;
    pub const ECDSA_WITH_P521_AND_SHA512: u16 = 0x0603;

    // EdDSA
    pub const ED25519: u16 = 0x0807;
    pub const ED448: u16 = 0x0808;
}

pub use signature_schemes::*;

/// SignatureScheme 类型别名
pub type SignatureScheme = u16;

/// 常用别名（浏览器指纹描述里惯用的名字）
pub const PSS_WITH_SHA256: u16 = signature_schemes::RSA_PSS_RSAE_SHA256;
pub const PSS_WITH_SHA384: u16 = signature_schemes::RSA_PSS_RSAE_SHA384;
pub const PSS_WITH_SHA512: u16 = signature_schemes::RSA_PSS_RSAE_SHA512;
pub const PKCS1_WITH_SHA256: u16 = signature_schemes::RSA_PKCS1_SHA256;
pub const PKCS1_WITH_SHA384: u16 = signature_schemes::RSA_PKCS1_SHA384;
pub const PKCS1_WITH_SHA512: u16 = signature_schemes::RSA_PKCS1_SHA512;
pub const PKCS1_WITH_SHA1: u16 = signature_schemes::RSA_PKCS1_SHA1;
