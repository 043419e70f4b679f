//! TLS Client Hello 配置
//!
//! 每个 preset 携带一份 `TlsSpec`：密码套件顺序、扩展顺序、命名组、
//! 签名算法、ALPN 与 key share 提供列表。GREASE 只记录位置，
//! 具体值在连接建立时由 [`GreaseDraw`] 抽取。
//!
//! `serialize_client_hello` 按 RFC 8446 的消息格式产出握手体字节，
//! 用于指纹基线校验（JA3/JA4 的输入就是这段字节）。

use super::grease::{is_grease_value, GreaseDraw};
use crate::dicttls::*;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// TLS 版本
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

/// Key Share 条目：preset 只声明组，密钥内容按连接生成
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyShareOffer {
    pub group: u16,
    /// 公钥长度（X25519=32、MLKEM768 混合=1216、P-256=65）
    pub key_len: usize,
}

/// 扩展声明（顺序即指纹）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionSpec {
    /// GREASE 扩展占位
    Grease,
    ServerName,
    ExtendedMasterSecret,
    RenegotiationInfo,
    SupportedGroups,
    EcPointFormats,
    SessionTicket,
    Alpn,
    StatusRequest,
    SignatureAlgorithms,
    Sct,
    KeyShare,
    PskKeyExchangeModes,
    SupportedVersions,
    CompressCertificate,
    ApplicationSettings,
    DelegatedCredential,
    RecordSizeLimit,
    /// ECH GREASE（真实 ECH 配置存在时替换为真实扩展）
    EncryptedClientHello,
    Padding,
    PreSharedKey,
}

impl ExtensionSpec {
    /// 扩展在 wire 上的类型号；GREASE 位置返回 None（按连接抽取）
    pub fn wire_type(&self) -> Option<u16> {
        match self {
            ExtensionSpec::Grease => None,
            ExtensionSpec::ServerName => Some(EXT_TYPE_SERVER_NAME),
            ExtensionSpec::ExtendedMasterSecret => Some(EXT_TYPE_EXTENDED_MASTER_SECRET),
            ExtensionSpec::RenegotiationInfo => Some(EXT_TYPE_RENEGOTIATION_INFO),
            ExtensionSpec::SupportedGroups => Some(EXT_TYPE_SUPPORTED_GROUPS),
            ExtensionSpec::EcPointFormats => Some(EXT_TYPE_EC_POINT_FORMATS),
            ExtensionSpec::SessionTicket => Some(EXT_TYPE_SESSION_TICKET),
            ExtensionSpec::Alpn => Some(EXT_TYPE_ALPN),
            ExtensionSpec::StatusRequest => Some(EXT_TYPE_STATUS_REQUEST),
            ExtensionSpec::SignatureAlgorithms => Some(EXT_TYPE_SIGNATURE_ALGORITHMS),
            ExtensionSpec::Sct => Some(EXT_TYPE_SIGNED_CERTIFICATE_TIMESTAMP),
            ExtensionSpec::KeyShare => Some(EXT_TYPE_KEY_SHARE),
            ExtensionSpec::PskKeyExchangeModes => Some(EXT_TYPE_PSK_KEY_EXCHANGE_MODES),
            ExtensionSpec::SupportedVersions => Some(EXT_TYPE_SUPPORTED_VERSIONS),
            ExtensionSpec::CompressCertificate => Some(EXT_TYPE_COMPRESS_CERTIFICATE),
            ExtensionSpec::ApplicationSettings => Some(EXT_TYPE_APPLICATION_SETTINGS_NEW),
            ExtensionSpec::DelegatedCredential => Some(EXT_TYPE_DELEGATED_CREDENTIAL),
            ExtensionSpec::RecordSizeLimit => Some(EXT_TYPE_RECORD_SIZE_LIMIT),
            ExtensionSpec::EncryptedClientHello => Some(EXT_TYPE_ECH),
            ExtensionSpec::Padding => Some(EXT_TYPE_PADDING),
            ExtensionSpec::PreSharedKey => Some(EXT_TYPE_PRE_SHARED_KEY),
        }
    }
}

/// TLS Client Hello 配置
#[derive(Debug, Clone)]
pub struct TlsSpec {
    /// 最低/最高协议版本
    pub min_version: TlsVersion,
    pub max_version: TlsVersion,
    /// 密码套件列表（含 GREASE 占位）
    pub cipher_suites: Vec<u16>,
    /// 扩展顺序（含 GREASE 占位）
    pub extensions: Vec<ExtensionSpec>,
    /// 命名组（含 GREASE 占位）
    pub supported_groups: Vec<u16>,
    /// 签名算法
    pub signature_algorithms: Vec<u16>,
    /// delegated_credentials 算法（Firefox）
    pub delegated_credentials: Vec<u16>,
    /// ALPN 协议列表
    pub alpn_protocols: Vec<String>,
    /// key share 提供的组（顺序即 wire 顺序；GREASE 占位允许）
    pub key_shares: Vec<KeyShareOffer>,
    /// supported_versions 内容（含 GREASE 占位）
    pub supported_versions: Vec<u16>,
    /// 证书压缩算法
    pub cert_compression: Vec<u16>,
    /// record_size_limit 值（Firefox 携带）
    pub record_size_limit: Option<u16>,
    /// ClientHello 是否带 32 字节兼容 session_id
    pub session_id_length: usize,
}

impl TlsSpec {
    /// HTTPS 场景默认 ALPN（拨号器会按协议裁剪）
    pub fn alpn_for(&self, proto: crate::error::Protocol) -> Vec<Vec<u8>> {
        let want = proto.as_str();
        if self.alpn_protocols.iter().any(|p| p == want) {
            vec![want.as_bytes().to_vec()]
        } else {
            self.alpn_protocols.iter().map(|p| p.as_bytes().to_vec()).collect()
        }
    }

    /// 序列化 ClientHello 握手体（不含 5 字节 record 头）
    ///
    /// 结构 (RFC 8446)：
    /// ```text
    /// uint16 legacy_version; Random random; opaque legacy_session_id<0..32>;
    /// CipherSuite cipher_suites<2..2^16-2>; opaque legacy_compression_methods<1..2^8-1>;
    /// Extension extensions<8..2^16-1>;
    /// ```
    pub fn serialize_client_hello(
        &self,
        server_name: &str,
        grease: &mut GreaseDraw,
        rng: &mut dyn RngCore,
    ) -> Vec<u8> {
        let mut body = Vec::with_capacity(512);

        // legacy_version 恒为 TLS 1.2
        body.extend_from_slice(&VERSION_TLS12.to_be_bytes());

        let mut random = [0u8; 32];
        rng.fill_bytes(&mut random);
        body.extend_from_slice(&random);

        // TLS 1.3 兼容模式 session_id
        body.push(self.session_id_length as u8);
        let mut session_id = vec![0u8; self.session_id_length];
        rng.fill_bytes(&mut session_id);
        body.extend_from_slice(&session_id);

        // 密码套件（GREASE 占位替换为抽取值）
        let suites: Vec<u16> = self
            .cipher_suites
            .iter()
            .map(|&c| if is_grease_value(c) { grease.cipher_suite() } else { c })
            .collect();
        body.extend_from_slice(&((suites.len() * 2) as u16).to_be_bytes());
        for s in &suites {
            body.extend_from_slice(&s.to_be_bytes());
        }

        // 压缩方法：null
        body.push(1);
        body.push(COMPRESSION_NONE);

        let ext = self.serialize_extensions(server_name, grease, rng);
        body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        body.extend_from_slice(&ext);

        // handshake 头：type=1 (client_hello) + 3 字节长度
        let mut msg = Vec::with_capacity(body.len() + 4);
        msg.push(0x01);
        let len = body.len() as u32;
        msg.extend_from_slice(&len.to_be_bytes()[1..]);
        msg.extend_from_slice(&body);
        msg
    }

    fn serialize_extensions(
        &self,
        server_name: &str,
        grease: &mut GreaseDraw,
        rng: &mut dyn RngCore,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        for ext in &self.extensions {
            let (id, data) = match ext {
                ExtensionSpec::Grease => (grease.extension(), vec![0x00]),
                ExtensionSpec::ServerName => (EXT_TYPE_SERVER_NAME, build_sni(server_name)),
                ExtensionSpec::ExtendedMasterSecret => (EXT_TYPE_EXTENDED_MASTER_SECRET, vec![]),
                ExtensionSpec::RenegotiationInfo => {
                    (EXT_TYPE_RENEGOTIATION_INFO, vec![0x00])
                }
                ExtensionSpec::SupportedGroups => {
                    let groups: Vec<u16> = self
                        .supported_groups
                        .iter()
                        .map(|&g| if is_grease_value(g) { grease.named_group() } else { g })
                        .collect();
                    (EXT_TYPE_SUPPORTED_GROUPS, u16_list(&groups))
                }
                ExtensionSpec::EcPointFormats => {
                    (EXT_TYPE_EC_POINT_FORMATS, vec![0x01, POINT_FORMAT_UNCOMPRESSED])
                }
                ExtensionSpec::SessionTicket => (EXT_TYPE_SESSION_TICKET, vec![]),
                ExtensionSpec::Alpn => (EXT_TYPE_ALPN, build_alpn(&self.alpn_protocols)),
                ExtensionSpec::StatusRequest => {
                    // status_type=ocsp + 空 responder/extensions 列表
                    (EXT_TYPE_STATUS_REQUEST, vec![0x01, 0x00, 0x00, 0x00, 0x00])
                }
                ExtensionSpec::SignatureAlgorithms => {
                    (EXT_TYPE_SIGNATURE_ALGORITHMS, u16_list(&self.signature_algorithms))
                }
                ExtensionSpec::Sct => (EXT_TYPE_SIGNED_CERTIFICATE_TIMESTAMP, vec![]),
                ExtensionSpec::KeyShare => {
                    (EXT_TYPE_KEY_SHARE, self.build_key_share(grease, rng))
                }
                ExtensionSpec::PskKeyExchangeModes => {
                    (EXT_TYPE_PSK_KEY_EXCHANGE_MODES, vec![0x01, PSK_MODE_DHE])
                }
                ExtensionSpec::SupportedVersions => {
                    let vers: Vec<u16> = self
                        .supported_versions
                        .iter()
                        .map(|&v| if is_grease_value(v) { grease.extension() } else { v })
                        .collect();
                    let mut d = vec![(vers.len() * 2) as u8];
                    for v in vers {
                        d.extend_from_slice(&v.to_be_bytes());
                    }
                    (EXT_TYPE_SUPPORTED_VERSIONS, d)
                }
                ExtensionSpec::CompressCertificate => {
                    let mut d = vec![(self.cert_compression.len() * 2) as u8];
                    for a in &self.cert_compression {
                        d.extend_from_slice(&a.to_be_bytes());
                    }
                    (EXT_TYPE_COMPRESS_CERTIFICATE, d)
                }
                ExtensionSpec::ApplicationSettings => {
                    (EXT_TYPE_APPLICATION_SETTINGS_NEW, build_alpn(&self.alps_protocols()))
                }
                ExtensionSpec::DelegatedCredential => {
                    (EXT_TYPE_DELEGATED_CREDENTIAL, u16_list(&self.delegated_credentials))
                }
                ExtensionSpec::RecordSizeLimit => {
                    let limit = self.record_size_limit.unwrap_or(0x4001);
                    (EXT_TYPE_RECORD_SIZE_LIMIT, limit.to_be_bytes().to_vec())
                }
                ExtensionSpec::EncryptedClientHello => {
                    (EXT_TYPE_ECH, build_grease_ech(rng))
                }
                ExtensionSpec::Padding => (EXT_TYPE_PADDING, vec![]),
                // PSK 必须位于扩展列表末位；占位为空，实际内容由 TLS 层在恢复时填充
                ExtensionSpec::PreSharedKey => (EXT_TYPE_PRE_SHARED_KEY, vec![]),
            };
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&(data.len() as u16).to_be_bytes());
            out.extend_from_slice(&data);
        }
        out
    }

    fn build_key_share(&self, grease: &mut GreaseDraw, rng: &mut dyn RngCore) -> Vec<u8> {
        let mut entries = Vec::new();
        for offer in &self.key_shares {
            let group = if is_grease_value(offer.group) {
                grease.named_group()
            } else {
                offer.group
            };
            entries.extend_from_slice(&group.to_be_bytes());
            entries.extend_from_slice(&(offer.key_len as u16).to_be_bytes());
            let mut key = vec![0u8; offer.key_len];
            rng.fill_bytes(&mut key);
            // GREASE 的 key share 固定一个零字节
            if is_grease_value(offer.group) {
                key = vec![0x00];
                let at = entries.len() - 2;
                entries[at..].copy_from_slice(&1u16.to_be_bytes());
            }
            entries.extend_from_slice(&key);
        }
        let mut d = Vec::with_capacity(entries.len() + 2);
        d.extend_from_slice(&(entries.len() as u16).to_be_bytes());
        d.extend_from_slice(&entries);
        d
    }

    /// ALPS 携带的协议集（h3 不参与 ALPS）
    fn alps_protocols(&self) -> Vec<String> {
        self.alpn_protocols
            .iter()
            .filter(|p| p.as_str() != "http/1.1")
            .cloned()
            .collect()
    }

    /// JA4 指纹（TLS 部分）：`t<ver><sni><c2><e2><alpn>_<cipher hash>_<ext hash>`
    ///
    /// 计数与哈希都排除 GREASE；扩展哈希排除 SNI 与 ALPN 两个上下文扩展。
    pub fn ja4(&self, sni_present: bool) -> String {
        let ver = match self.max_version {
            TlsVersion::Tls13 => "13",
            TlsVersion::Tls12 => "12",
        };
        let sni = if sni_present { "d" } else { "i" };

        let ciphers: Vec<u16> = self
            .cipher_suites
            .iter()
            .copied()
            .filter(|c| !is_grease_value(*c))
            .collect();

        let ext_ids: Vec<u16> = self
            .extensions
            .iter()
            .filter_map(|e| e.wire_type())
            .collect();
        let hashed_exts: Vec<u16> = ext_ids
            .iter()
            .copied()
            .filter(|&id| id != EXT_TYPE_SERVER_NAME && id != EXT_TYPE_ALPN)
            .collect();

        let alpn = self
            .alpn_protocols
            .first()
            .map(|p| {
                let b = p.as_bytes();
                format!("{}{}", b[0] as char, b[b.len() - 1] as char)
            })
            .unwrap_or_else(|| "00".to_string());

        let mut sorted_ciphers = ciphers.clone();
        sorted_ciphers.sort_unstable();
        let mut sorted_exts = hashed_exts.clone();
        sorted_exts.sort_unstable();

        let cipher_str = sorted_ciphers
            .iter()
            .map(|c| format!("{c:04x}"))
            .collect::<Vec<_>>()
            .join(",");
        let ext_str = format!(
            "{}_{}",
            sorted_exts.iter().map(|e| format!("{e:04x}")).collect::<Vec<_>>().join(","),
            self.signature_algorithms
                .iter()
                .map(|s| format!("{s:04x}"))
                .collect::<Vec<_>>()
                .join(",")
        );

        format!(
            "t{}{}{:02}{:02}{}_{}_{}",
            ver,
            sni,
            ciphers.len(),
            ext_ids.len(),
            alpn,
            truncated_sha256(&cipher_str),
            truncated_sha256(&ext_str),
        )
    }
}

fn truncated_sha256(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest[..6].iter().map(|b| format!("{b:02x}")).collect()
}

fn u16_list(values: &[u16]) -> Vec<u8> {
    let mut d = Vec::with_capacity(values.len() * 2 + 2);
    d.extend_from_slice(&((values.len() * 2) as u16).to_be_bytes());
    for v in values {
        d.extend_from_slice(&v.to_be_bytes());
    }
    d
}

fn build_sni(server_name: &str) -> Vec<u8> {
    // ServerNameList: list_len(2) + type=host_name(1) + name_len(2) + name
    let name = server_name.as_bytes();
    let mut d = Vec::with_capacity(name.len() + 5);
    d.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    d.push(0x00);
    d.extend_from_slice(&(name.len() as u16).to_be_bytes());
    d.extend_from_slice(name);
    d
}

fn build_alpn(protocols: &[String]) -> Vec<u8> {
    let mut list = Vec::new();
    for p in protocols {
        list.push(p.len() as u8);
        list.extend_from_slice(p.as_bytes());
    }
    let mut d = Vec::with_capacity(list.len() + 2);
    d.extend_from_slice(&(list.len() as u16).to_be_bytes());
    d.extend_from_slice(&list);
    d
}

/// GREASE ECH：outer 形态的占位负载，长度分布模仿 BoringSSL
fn build_grease_ech(rng: &mut dyn RngCore) -> Vec<u8> {
    let mut d = Vec::with_capacity(200);
    d.push(0x00); // client hello outer
    d.extend_from_slice(&[0x00, 0x01]); // kdf: HKDF-SHA256
    d.extend_from_slice(&[0x00, 0x01]); // aead: AES-128-GCM
    let mut cfg_id = [0u8; 1];
    rng.fill_bytes(&mut cfg_id);
    d.push(cfg_id[0]);
    let mut enc = [0u8; 32];
    rng.fill_bytes(&mut enc);
    d.extend_from_slice(&(enc.len() as u16).to_be_bytes());
    d.extend_from_slice(&enc);
    let mut payload = vec![0u8; 144];
    rng.fill_bytes(&mut payload);
    d.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    d.extend_from_slice(&payload);
    d
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn chrome_like() -> TlsSpec {
        crate::preset::lookup("chrome-143").unwrap().tls.clone()
    }

    #[test]
    fn test_client_hello_structure() {
        let spec = chrome_like();
        let mut grease = GreaseDraw::new(1, 1);
        let mut rng = StdRng::seed_from_u64(3);
        let hello = spec.serialize_client_hello("example.test", &mut grease, &mut rng);

        // handshake 头
        assert_eq!(hello[0], 0x01);
        let len = u32::from_be_bytes([0, hello[1], hello[2], hello[3]]) as usize;
        assert_eq!(len, hello.len() - 4);
        // legacy_version = TLS 1.2
        assert_eq!(&hello[4..6], &[0x03, 0x03]);
        // session_id 长度 32
        assert_eq!(hello[4 + 2 + 32], 32);
    }

    #[test]
    fn test_client_hello_contains_sni() {
        let spec = chrome_like();
        let mut grease = GreaseDraw::new(1, 1);
        let mut rng = StdRng::seed_from_u64(3);
        let hello = spec.serialize_client_hello("example.test", &mut grease, &mut rng);
        let needle = b"example.test";
        assert!(hello.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn test_grease_positions_randomized_not_positions() {
        let spec = chrome_like();
        let mut r1 = StdRng::seed_from_u64(3);
        let mut r2 = StdRng::seed_from_u64(3);
        let h1 = spec.serialize_client_hello("a.test", &mut GreaseDraw::new(1, 1), &mut r1);
        let h2 = spec.serialize_client_hello("a.test", &mut GreaseDraw::new(1, 2), &mut r2);
        // 相同随机体，不同 GREASE 抽取：长度一致（GREASE 只换值不换形状）
        assert_eq!(h1.len(), h2.len());
    }

    #[test]
    fn test_ja4_shape() {
        let spec = chrome_like();
        let ja4 = spec.ja4(true);
        // Chrome：TLS 1.3、带 SNI、ALPN h2 首尾字符
        assert!(ja4.starts_with("t13d"), "{ja4}");
        let parts: Vec<&str> = ja4.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].len(), 12);
        assert_eq!(parts[2].len(), 12);
    }

    #[test]
    fn test_ja4_stable_across_connections() {
        let spec = chrome_like();
        assert_eq!(spec.ja4(true), spec.ja4(true));
    }
}
