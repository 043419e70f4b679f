//! rustls 配置构建（TCP-TLS 与 QUIC 两侧共用）
//!
//! preset 的 `TlsSpec` 尽量映射进 rustls builder：套件顺序、kx 组、
//! 版本、ALPN。rustls 不认识的项（GREASE、MLKEM 混合组）跳过，
//! ClientHello 逐字节形状由序列化基线另行校验。
//! 票据缓存桥接 rustls 的恢复存储；key log 两侧共用一个 sink。

use crate::error::{Error, Result};
use crate::keylog::KeyLogSink;
use crate::preset::{is_grease_value, Preset, TlsVersion};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// 证书 pin：叶子证书 DER 的 SHA-256
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPin {
    pub sha256: [u8; 32],
}

impl CertPin {
    /// 接受 `sha256/<base64>` 或 64 位十六进制
    pub fn parse(s: &str) -> Result<Self> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;

        let digest: Vec<u8> = if let Some(b64) = s.strip_prefix("sha256/") {
            STANDARD
                .decode(b64)
                .map_err(|_| Error::Configuration(format!("非法证书 pin: {s}")))?
        } else {
            (0..s.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(s.get(i..i + 2).unwrap_or("zz"), 16))
                .collect::<std::result::Result<Vec<u8>, _>>()
                .map_err(|_| Error::Configuration(format!("非法证书 pin: {s}")))?
        };
        let sha256: [u8; 32] =
            digest.try_into().map_err(|_| Error::Configuration(format!("证书 pin 长度错误: {s}")))?;
        Ok(Self { sha256 })
    }

    pub fn of_der(der: &[u8]) -> Self {
        let digest = Sha256::digest(der);
        Self { sha256: digest.into() }
    }
}

/// 握手后校验 pin；不匹配为致命错误
pub fn verify_pins(pins: &[CertPin], certs: &[rustls::Certificate], host: &str) -> Result<()> {
    if pins.is_empty() {
        return Ok(());
    }
    let leaf = certs
        .first()
        .ok_or_else(|| Error::CertificatePinMismatch { host: host.to_string() })?;
    let actual = CertPin::of_der(&leaf.0);
    if pins.contains(&actual) {
        Ok(())
    } else {
        Err(Error::CertificatePinMismatch { host: host.to_string() })
    }
}

/// verify_tls=false 时接受所有证书（调试/内网）
struct NoCertificateVerification;

impl rustls::client::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// Mozilla 根证书库
pub fn build_root_store() -> rustls::RootCertStore {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    root_store
}

/// TLS 构建参数
pub struct TlsOptions {
    pub verify_tls: bool,
    pub alpn: Vec<Vec<u8>>,
    pub keylog: Option<Arc<KeyLogSink>>,
    pub enable_early_data: bool,
}

/// 由 preset 构建 rustls::ClientConfig
pub fn build_client_config(preset: &Preset, opts: TlsOptions) -> rustls::ClientConfig {
    let root_store = build_root_store();

    let mut cfg = match try_spec_builder(preset) {
        Some(builder) => builder.with_root_certificates(root_store).with_no_client_auth(),
        None => rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    };

    cfg.alpn_protocols = opts.alpn;
    cfg.enable_sni = true;

    if opts.enable_early_data {
        cfg.enable_early_data = true;
    }
    if let Some(sink) = opts.keylog {
        cfg.key_log = sink;
    }
    if !opts.verify_tls {
        cfg.dangerous().set_certificate_verifier(Arc::new(NoCertificateVerification));
    }

    cfg
}

type SpecBuilder = rustls::ConfigBuilder<rustls::ClientConfig, rustls::WantsVerifier>;

/// 把 spec 的套件/组/版本映射到 rustls；映射不出就退安全默认
fn try_spec_builder(preset: &Preset) -> Option<SpecBuilder> {
    let spec = &preset.tls;

    let mut cipher_suites: Vec<rustls::SupportedCipherSuite> = Vec::new();
    for id in spec.cipher_suites.iter().copied().filter(|id| !is_grease_value(*id)) {
        if let Some(cs) =
            rustls::ALL_CIPHER_SUITES.iter().copied().find(|cs| cs.suite().get_u16() == id)
        {
            cipher_suites.push(cs);
        }
    }
    if cipher_suites.is_empty() {
        return None;
    }

    let mut kx_groups: Vec<&'static rustls::SupportedKxGroup> = Vec::new();
    for id in spec.supported_groups.iter().copied().filter(|id| !is_grease_value(*id)) {
        let g = match id {
            crate::dicttls::X25519 => Some(&rustls::kx_group::X25519),
            crate::dicttls::CURVE_P256 => Some(&rustls::kx_group::SECP256R1),
            crate::dicttls::CURVE_P384 => Some(&rustls::kx_group::SECP384R1),
            // MLKEM 混合组 / P-521 / FFDHE：rustls 0.21 不支持，跳过
            _ => None,
        };
        if let Some(g) = g {
            if !kx_groups.iter().any(|existing| std::ptr::eq(*existing, g)) {
                kx_groups.push(g);
            }
        }
    }
    if kx_groups.is_empty() {
        return None;
    }

    let mut versions: Vec<&'static rustls::SupportedProtocolVersion> = Vec::new();
    if spec.max_version == TlsVersion::Tls13 {
        versions.push(&rustls::version::TLS13);
    }
    if spec.min_version == TlsVersion::Tls12 {
        versions.push(&rustls::version::TLS12);
    }

    rustls::ClientConfig::builder()
        .with_cipher_suites(&cipher_suites)
        .with_kx_groups(&kx_groups)
        .with_protocol_versions(&versions)
        .ok()
}

/// 从 rustls 错误里提取对端告警码（指纹可疑分类用）
pub fn alert_code(err: &rustls::Error) -> Option<u8> {
    match err {
        rustls::Error::AlertReceived(desc) => Some(desc.get_u8()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preset::lookup;

    #[test]
    fn test_cert_pin_parse_hex() {
        let hex = "ab".repeat(32);
        let pin = CertPin::parse(&hex).unwrap();
        assert_eq!(pin.sha256[0], 0xab);
    }

    #[test]
    fn test_cert_pin_parse_base64() {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        let b64 = STANDARD.encode([7u8; 32]);
        let pin = CertPin::parse(&format!("sha256/{b64}")).unwrap();
        assert_eq!(pin.sha256, [7u8; 32]);
    }

    #[test]
    fn test_cert_pin_parse_rejects_bad_length() {
        assert!(CertPin::parse("abcd").is_err());
    }

    #[test]
    fn test_verify_pins_match_and_mismatch() {
        let der = rustls::Certificate(vec![1, 2, 3]);
        let good = CertPin::of_der(&der.0);
        assert!(verify_pins(&[good], std::slice::from_ref(&der), "x.test").is_ok());

        let bad = CertPin { sha256: [0; 32] };
        let err = verify_pins(&[bad], &[der], "x.test").unwrap_err();
        assert!(matches!(err, Error::CertificatePinMismatch { .. }));
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_verify_pins_empty_passes() {
        assert!(verify_pins(&[], &[], "x.test").is_ok());
    }

    #[test]
    fn test_build_config_maps_spec() {
        let preset = lookup("chrome-143").unwrap();
        let cfg = build_client_config(
            &preset,
            TlsOptions {
                verify_tls: true,
                alpn: vec![b"h2".to_vec()],
                keylog: None,
                enable_early_data: false,
            },
        );
        assert_eq!(cfg.alpn_protocols, vec![b"h2".to_vec()]);
    }
}
