//! preset 目录
//!
//! 每个浏览器版本一份完整定义。TLS 数据以公开抓包为基线：
//! 密码套件与扩展的顺序、GREASE 位置、key share 提供列表
//! 都必须与目标浏览器逐字节对应。

use super::h2_spec::{H2Setting, H2Spec, PriorityFrame, PriorityParam, PseudoHeader};
use super::h3_spec::{H3Settings, H3Spec, QuicTransportParams};
use super::template::{HeaderSlot, HeaderTemplate, PlatformInfo, SlotValue};
use super::tls_spec::{ExtensionSpec, KeyShareOffer, TlsSpec, TlsVersion};
use super::{BrowserFamily, Preset, ProtocolSupport};
use crate::dicttls::cipher_suites::{self as cs, GREASE_PLACEHOLDER as GREASE_CS};
use crate::dicttls::signature_schemes as ss;
use crate::dicttls::supported_groups::{GREASE_PLACEHOLDER as GREASE_SG, FFDHE2048, FFDHE3072};
use crate::dicttls::{
    CERT_COMPRESSION_BROTLI, CERT_COMPRESSION_ZLIB, CURVE_P256, CURVE_P384, SECP521R1,
    VERSION_TLS12, VERSION_TLS13, X25519, X25519_MLKEM768,
};
use std::time::Duration;

/// 别名 → 具体版本（注册表构建时解析）
pub const ALIASES: &[(&str, &str)] = &[
    ("chrome-latest", "chrome-143"),
    ("firefox-latest", "firefox-133"),
    ("safari-latest", "safari-18"),
];

/// 构建全部 preset
pub fn build_all() -> Vec<Preset> {
    vec![
        chrome_143("chrome-143", platform_windows()),
        chrome_143("chrome-143-windows", platform_windows()),
        chrome_143("chrome-143-macos", platform_macos()),
        chrome_143("chrome-143-linux", platform_linux()),
        chrome_131(),
        firefox_133(),
        safari_18(),
        chrome_mobile_android(),
        chrome_mobile_ios(),
        safari_mobile_ios(),
    ]
}

// ---------------------------------------------------------------- 平台

fn platform_windows() -> PlatformInfo {
    PlatformInfo {
        os: "Windows",
        os_version: "15.0.0",
        arch: "x86",
        bitness: "64",
        model: "",
        mobile: false,
    }
}

fn platform_macos() -> PlatformInfo {
    PlatformInfo {
        os: "macOS",
        os_version: "15.2.0",
        arch: "arm",
        bitness: "64",
        model: "",
        mobile: false,
    }
}

fn platform_linux() -> PlatformInfo {
    PlatformInfo {
        os: "Linux",
        os_version: "6.8.0",
        arch: "x86",
        bitness: "64",
        model: "",
        mobile: false,
    }
}

fn platform_android() -> PlatformInfo {
    PlatformInfo {
        os: "Android",
        os_version: "14.0.0",
        arch: "arm",
        bitness: "64",
        model: "Pixel 8",
        mobile: true,
    }
}

fn platform_ios() -> PlatformInfo {
    PlatformInfo {
        os: "iOS",
        os_version: "18.2.0",
        arch: "arm",
        bitness: "64",
        model: "iPhone",
        mobile: true,
    }
}

// ---------------------------------------------------------------- Chrome

fn chrome_cipher_suites() -> Vec<u16> {
    vec![
        GREASE_CS,
        cs::TLS_AES_128_GCM_SHA256,
        cs::TLS_AES_256_GCM_SHA384,
        cs::TLS_CHACHA20_POLY1305_SHA256,
        cs::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        cs::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        cs::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        cs::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        cs::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        cs::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        cs::TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA,
        cs::TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA,
        cs::TLS_RSA_WITH_AES_128_GCM_SHA256,
        cs::TLS_RSA_WITH_AES_256_GCM_SHA384,
        cs::TLS_RSA_WITH_AES_128_CBC_SHA,
        cs::TLS_RSA_WITH_AES_256_CBC_SHA,
    ]
}

fn chrome_signature_algorithms() -> Vec<u16> {
    vec![
        ss::ECDSA_WITH_P256_AND_SHA256,
        ss::RSA_PSS_RSAE_SHA256,
        ss::RSA_PKCS1_SHA256,
        ss::ECDSA_WITH_P384_AND_SHA384,
        ss::RSA_PSS_RSAE_SHA384,
        ss::RSA_PKCS1_SHA384,
        ss::RSA_PSS_RSAE_SHA512,
        ss::RSA_PKCS1_SHA512,
    ]
}

fn chrome_tls() -> TlsSpec {
    TlsSpec {
        min_version: TlsVersion::Tls12,
        max_version: TlsVersion::Tls13,
        cipher_suites: chrome_cipher_suites(),
        // Chrome 从 110 起随连接置换扩展顺序；JA4 对顺序不敏感，
        // 这里固定一个有代表性的排列
        extensions: vec![
            ExtensionSpec::Grease,
            ExtensionSpec::ServerName,
            ExtensionSpec::ExtendedMasterSecret,
            ExtensionSpec::RenegotiationInfo,
            ExtensionSpec::SupportedGroups,
            ExtensionSpec::EcPointFormats,
            ExtensionSpec::SessionTicket,
            ExtensionSpec::Alpn,
            ExtensionSpec::StatusRequest,
            ExtensionSpec::SignatureAlgorithms,
            ExtensionSpec::KeyShare,
            ExtensionSpec::PskKeyExchangeModes,
            ExtensionSpec::SupportedVersions,
            ExtensionSpec::CompressCertificate,
            ExtensionSpec::ApplicationSettings,
            ExtensionSpec::EncryptedClientHello,
            ExtensionSpec::Grease,
        ],
        supported_groups: vec![GREASE_SG, X25519_MLKEM768, X25519, CURVE_P256, CURVE_P384],
        signature_algorithms: chrome_signature_algorithms(),
        delegated_credentials: vec![],
        alpn_protocols: vec!["h2".to_string(), "http/1.1".to_string()],
        key_shares: vec![
            KeyShareOffer { group: GREASE_SG, key_len: 1 },
            KeyShareOffer { group: X25519_MLKEM768, key_len: 1216 },
            KeyShareOffer { group: X25519, key_len: 32 },
        ],
        supported_versions: vec![GREASE_SG, VERSION_TLS13, VERSION_TLS12],
        cert_compression: vec![CERT_COMPRESSION_BROTLI],
        record_size_limit: None,
        session_id_length: 32,
    }
}

fn chrome_h2() -> H2Spec {
    H2Spec {
        settings: vec![
            (H2Setting::HeaderTableSize.as_u16(), 65536),
            (H2Setting::EnablePush.as_u16(), 0),
            (H2Setting::InitialWindowSize.as_u16(), 6291456),
            (H2Setting::MaxHeaderListSize.as_u16(), 262144),
        ],
        connection_window_update: 15663105,
        priority_frames: vec![],
        header_priority: Some(PriorityParam {
            stream_dependency: 0,
            exclusive: true,
            weight: 255,
        }),
        pseudo_header_order: [
            PseudoHeader::Method,
            PseudoHeader::Authority,
            PseudoHeader::Scheme,
            PseudoHeader::Path,
        ],
    }
}

fn chrome_h3() -> H3Spec {
    H3Spec {
        transport: QuicTransportParams {
            max_idle_timeout: Duration::from_secs(30),
            max_udp_payload_size: 1472,
            initial_max_data: 15_728_640,
            initial_max_stream_data_bidi_local: 6_291_456,
            initial_max_stream_data_bidi_remote: 6_291_456,
            initial_max_stream_data_uni: 6_291_456,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 103,
            active_connection_id_limit: 8,
            max_datagram_frame_size: Some(65536),
            grease_quic_bit: true,
        },
        settings: H3Settings {
            qpack_max_table_capacity: 65536,
            qpack_blocked_streams: 100,
            h3_datagram: true,
            grease_setting: true,
        },
        initial_packet_padding: 1200,
    }
}

fn chrome_slots() -> Vec<HeaderSlot> {
    vec![
        HeaderSlot { name: "Host", value: SlotValue::Host },
        HeaderSlot { name: "Connection", value: SlotValue::Static("keep-alive") },
        HeaderSlot { name: "Sec-Ch-Ua", value: SlotValue::SecChUa },
        HeaderSlot { name: "Sec-Ch-Ua-Mobile", value: SlotValue::SecChUaMobile },
        HeaderSlot { name: "Sec-Ch-Ua-Platform", value: SlotValue::SecChUaPlatform },
        HeaderSlot {
            name: "Upgrade-Insecure-Requests",
            value: SlotValue::UpgradeInsecureRequests,
        },
        HeaderSlot { name: "User-Agent", value: SlotValue::UserAgent },
        HeaderSlot { name: "Accept", value: SlotValue::Accept },
        HeaderSlot { name: "Sec-Fetch-Site", value: SlotValue::SecFetchSite },
        HeaderSlot { name: "Sec-Fetch-Mode", value: SlotValue::SecFetchMode },
        HeaderSlot { name: "Sec-Fetch-User", value: SlotValue::SecFetchUser },
        HeaderSlot { name: "Sec-Fetch-Dest", value: SlotValue::SecFetchDest },
        HeaderSlot { name: "Referer", value: SlotValue::Referer },
        HeaderSlot { name: "Accept-Encoding", value: SlotValue::AcceptEncoding },
        HeaderSlot { name: "Accept-Language", value: SlotValue::AcceptLanguage },
        HeaderSlot { name: "", value: SlotValue::Extras },
        HeaderSlot { name: "Cookie", value: SlotValue::Cookie },
    ]
}

fn chrome_headers(user_agent: &'static str, sec_ch_ua: &'static str) -> HeaderTemplate {
    HeaderTemplate {
        user_agent,
        sec_ch_ua,
        accept_language: "en-US,en;q=0.9",
        accept_encoding: "gzip, deflate, br, zstd",
        slots: chrome_slots(),
        emit_sec_fetch: true,
    }
}

const CHROME_143_UA_WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/143.0.0.0 Safari/537.36";
const CHROME_143_UA_MACOS: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/143.0.0.0 Safari/537.36";
const CHROME_143_UA_LINUX: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/143.0.0.0 Safari/537.36";
const CHROME_143_SEC_CH_UA: &str =
    "\"Chromium\";v=\"143\", \"Google Chrome\";v=\"143\", \"Not;A=Brand\";v=\"99\"";

fn chrome_143(name: &'static str, platform: PlatformInfo) -> Preset {
    let ua = match platform.os {
        "macOS" => CHROME_143_UA_MACOS,
        "Linux" => CHROME_143_UA_LINUX,
        _ => CHROME_143_UA_WINDOWS,
    };
    Preset {
        name,
        family: BrowserFamily::Chrome,
        tls: chrome_tls(),
        h2: chrome_h2(),
        h3: Some(chrome_h3()),
        headers: chrome_headers(ua, CHROME_143_SEC_CH_UA),
        platform,
        supports: ProtocolSupport { h1: true, h2: true, h3: true },
    }
}

fn chrome_131() -> Preset {
    const UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
    const SEC_CH_UA: &str =
        "\"Google Chrome\";v=\"131\", \"Chromium\";v=\"131\", \"Not_A Brand\";v=\"24\"";
    Preset {
        name: "chrome-131",
        family: BrowserFamily::Chrome,
        tls: chrome_tls(),
        h2: chrome_h2(),
        h3: Some(chrome_h3()),
        headers: chrome_headers(UA, SEC_CH_UA),
        platform: platform_windows(),
        supports: ProtocolSupport { h1: true, h2: true, h3: true },
    }
}

fn chrome_mobile_android() -> Preset {
    const UA: &str = "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/143.0.0.0 Mobile Safari/537.36";
    Preset {
        name: "chrome-mobile-android",
        family: BrowserFamily::Chrome,
        tls: chrome_tls(),
        h2: chrome_h2(),
        h3: Some(chrome_h3()),
        headers: chrome_headers(UA, CHROME_143_SEC_CH_UA),
        platform: platform_android(),
        supports: ProtocolSupport { h1: true, h2: true, h3: true },
    }
}

/// iOS 上的 Chrome 走系统 WebKit 网络栈：TLS/H2 形同 Safari，UA 是 CriOS
fn chrome_mobile_ios() -> Preset {
    const UA: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 18_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) CriOS/143.0.0.0 Mobile/15E148 Safari/604.1";
    Preset {
        name: "chrome-mobile-ios",
        family: BrowserFamily::Safari,
        tls: safari_tls(),
        h2: safari_h2(),
        h3: Some(safari_h3()),
        headers: safari_headers(UA),
        platform: platform_ios(),
        supports: ProtocolSupport { h1: true, h2: true, h3: true },
    }
}

// ---------------------------------------------------------------- Firefox

fn firefox_133() -> Preset {
    const UA: &str =
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0";
    Preset {
        name: "firefox-133",
        family: BrowserFamily::Firefox,
        tls: firefox_tls(),
        h2: firefox_h2(),
        h3: Some(firefox_h3()),
        headers: firefox_headers(UA),
        platform: platform_windows(),
        supports: ProtocolSupport { h1: true, h2: true, h3: true },
    }
}

fn firefox_tls() -> TlsSpec {
    TlsSpec {
        min_version: TlsVersion::Tls12,
        max_version: TlsVersion::Tls13,
        // Firefox 不使用 GREASE
        cipher_suites: vec![
            cs::TLS_AES_128_GCM_SHA256,
            cs::TLS_CHACHA20_POLY1305_SHA256,
            cs::TLS_AES_256_GCM_SHA384,
            cs::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            cs::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            cs::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            cs::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            cs::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            cs::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            cs::TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA,
            cs::TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA,
            cs::TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA,
            cs::TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA,
            cs::TLS_RSA_WITH_AES_128_GCM_SHA256,
            cs::TLS_RSA_WITH_AES_256_GCM_SHA384,
            cs::TLS_RSA_WITH_AES_128_CBC_SHA,
            cs::TLS_RSA_WITH_AES_256_CBC_SHA,
        ],
        extensions: vec![
            ExtensionSpec::ServerName,
            ExtensionSpec::ExtendedMasterSecret,
            ExtensionSpec::RenegotiationInfo,
            ExtensionSpec::SupportedGroups,
            ExtensionSpec::EcPointFormats,
            ExtensionSpec::SessionTicket,
            ExtensionSpec::Alpn,
            ExtensionSpec::StatusRequest,
            ExtensionSpec::DelegatedCredential,
            ExtensionSpec::KeyShare,
            ExtensionSpec::SupportedVersions,
            ExtensionSpec::SignatureAlgorithms,
            ExtensionSpec::PskKeyExchangeModes,
            ExtensionSpec::RecordSizeLimit,
            ExtensionSpec::EncryptedClientHello,
            ExtensionSpec::Padding,
        ],
        supported_groups: vec![
            X25519_MLKEM768,
            X25519,
            CURVE_P256,
            CURVE_P384,
            SECP521R1,
            FFDHE2048,
            FFDHE3072,
        ],
        signature_algorithms: vec![
            ss::ECDSA_WITH_P256_AND_SHA256,
            ss::ECDSA_WITH_P384_AND_SHA384,
            ss::ECDSA_WITH_P521_AND_SHA512,
            ss::RSA_PSS_RSAE_SHA256,
            ss::RSA_PSS_RSAE_SHA384,
            ss::RSA_PSS_RSAE_SHA512,
            ss::RSA_PKCS1_SHA256,
            ss::RSA_PKCS1_SHA384,
            ss::RSA_PKCS1_SHA512,
            ss::ECDSA_SHA1,
            ss::RSA_PKCS1_SHA1,
        ],
        delegated_credentials: vec![
            ss::ECDSA_WITH_P256_AND_SHA256,
            ss::ECDSA_WITH_P384_AND_SHA384,
            ss::ECDSA_WITH_P521_AND_SHA512,
            ss::ECDSA_SHA1,
        ],
        alpn_protocols: vec!["h2".to_string(), "http/1.1".to_string()],
        key_shares: vec![
            KeyShareOffer { group: X25519_MLKEM768, key_len: 1216 },
            KeyShareOffer { group: X25519, key_len: 32 },
            KeyShareOffer { group: CURVE_P256, key_len: 65 },
        ],
        supported_versions: vec![VERSION_TLS13, VERSION_TLS12],
        cert_compression: vec![],
        record_size_limit: Some(0x4001),
        session_id_length: 32,
    }
}

fn firefox_h2() -> H2Spec {
    H2Spec {
        settings: vec![
            (H2Setting::HeaderTableSize.as_u16(), 65536),
            (H2Setting::InitialWindowSize.as_u16(), 131072),
            (H2Setting::MaxFrameSize.as_u16(), 16384),
        ],
        connection_window_update: 12517377,
        // Firefox 在连接建立时铺设优先级树
        priority_frames: vec![
            PriorityFrame {
                stream_id: 3,
                param: PriorityParam { stream_dependency: 0, exclusive: false, weight: 200 },
            },
            PriorityFrame {
                stream_id: 5,
                param: PriorityParam { stream_dependency: 0, exclusive: false, weight: 100 },
            },
            PriorityFrame {
                stream_id: 7,
                param: PriorityParam { stream_dependency: 0, exclusive: false, weight: 0 },
            },
            PriorityFrame {
                stream_id: 9,
                param: PriorityParam { stream_dependency: 7, exclusive: false, weight: 0 },
            },
            PriorityFrame {
                stream_id: 11,
                param: PriorityParam { stream_dependency: 3, exclusive: false, weight: 0 },
            },
            PriorityFrame {
                stream_id: 13,
                param: PriorityParam { stream_dependency: 0, exclusive: false, weight: 240 },
            },
        ],
        header_priority: Some(PriorityParam {
            stream_dependency: 13,
            exclusive: false,
            weight: 41,
        }),
        pseudo_header_order: [
            PseudoHeader::Method,
            PseudoHeader::Path,
            PseudoHeader::Authority,
            PseudoHeader::Scheme,
        ],
    }
}

fn firefox_h3() -> H3Spec {
    H3Spec {
        transport: QuicTransportParams {
            max_idle_timeout: Duration::from_secs(30),
            max_udp_payload_size: 1472,
            initial_max_data: 12_582_912,
            initial_max_stream_data_bidi_local: 1_048_576,
            initial_max_stream_data_bidi_remote: 1_048_576,
            initial_max_stream_data_uni: 1_048_576,
            initial_max_streams_bidi: 16,
            initial_max_streams_uni: 16,
            active_connection_id_limit: 4,
            max_datagram_frame_size: Some(65535),
            grease_quic_bit: true,
        },
        settings: H3Settings {
            qpack_max_table_capacity: 65536,
            qpack_blocked_streams: 20,
            h3_datagram: true,
            grease_setting: true,
        },
        initial_packet_padding: 1200,
    }
}

fn firefox_headers(user_agent: &'static str) -> HeaderTemplate {
    HeaderTemplate {
        user_agent,
        sec_ch_ua: "",
        accept_language: "en-US,en;q=0.5",
        accept_encoding: "gzip, deflate, br, zstd",
        slots: vec![
            HeaderSlot { name: "Host", value: SlotValue::Host },
            HeaderSlot { name: "User-Agent", value: SlotValue::UserAgent },
            HeaderSlot { name: "Accept", value: SlotValue::Accept },
            HeaderSlot { name: "Accept-Language", value: SlotValue::AcceptLanguage },
            HeaderSlot { name: "Accept-Encoding", value: SlotValue::AcceptEncoding },
            HeaderSlot { name: "Referer", value: SlotValue::Referer },
            HeaderSlot { name: "", value: SlotValue::Extras },
            HeaderSlot { name: "Cookie", value: SlotValue::Cookie },
            HeaderSlot {
                name: "Upgrade-Insecure-Requests",
                value: SlotValue::UpgradeInsecureRequests,
            },
            HeaderSlot { name: "Sec-Fetch-Dest", value: SlotValue::SecFetchDest },
            HeaderSlot { name: "Sec-Fetch-Mode", value: SlotValue::SecFetchMode },
            HeaderSlot { name: "Sec-Fetch-Site", value: SlotValue::SecFetchSite },
            HeaderSlot { name: "Sec-Fetch-User", value: SlotValue::SecFetchUser },
            HeaderSlot { name: "Te", value: SlotValue::Static("trailers") },
        ],
        emit_sec_fetch: true,
    }
}

// ---------------------------------------------------------------- Safari

fn safari_18() -> Preset {
    const UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.2 Safari/605.1.15";
    Preset {
        name: "safari-18",
        family: BrowserFamily::Safari,
        tls: safari_tls(),
        h2: safari_h2(),
        h3: Some(safari_h3()),
        headers: safari_headers(UA),
        platform: platform_macos(),
        supports: ProtocolSupport { h1: true, h2: true, h3: true },
    }
}

fn safari_mobile_ios() -> Preset {
    const UA: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 18_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.2 Mobile/15E148 Safari/604.1";
    Preset {
        name: "safari-mobile-ios",
        family: BrowserFamily::Safari,
        tls: safari_tls(),
        h2: safari_h2(),
        h3: Some(safari_h3()),
        headers: safari_headers(UA),
        platform: platform_ios(),
        supports: ProtocolSupport { h1: true, h2: true, h3: true },
    }
}

fn safari_tls() -> TlsSpec {
    TlsSpec {
        min_version: TlsVersion::Tls12,
        max_version: TlsVersion::Tls13,
        cipher_suites: vec![
            GREASE_CS,
            cs::TLS_AES_128_GCM_SHA256,
            cs::TLS_AES_256_GCM_SHA384,
            cs::TLS_CHACHA20_POLY1305_SHA256,
            cs::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            cs::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            cs::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            cs::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            cs::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            cs::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            cs::TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA,
            cs::TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA,
            cs::TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA,
            cs::TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA,
            cs::TLS_RSA_WITH_AES_256_GCM_SHA384,
            cs::TLS_RSA_WITH_AES_128_GCM_SHA256,
            cs::TLS_RSA_WITH_AES_256_CBC_SHA,
            cs::TLS_RSA_WITH_AES_128_CBC_SHA,
            cs::TLS_RSA_WITH_3DES_EDE_CBC_SHA,
        ],
        extensions: vec![
            ExtensionSpec::Grease,
            ExtensionSpec::ServerName,
            ExtensionSpec::ExtendedMasterSecret,
            ExtensionSpec::RenegotiationInfo,
            ExtensionSpec::SupportedGroups,
            ExtensionSpec::EcPointFormats,
            ExtensionSpec::Alpn,
            ExtensionSpec::StatusRequest,
            ExtensionSpec::SignatureAlgorithms,
            ExtensionSpec::Sct,
            ExtensionSpec::KeyShare,
            ExtensionSpec::PskKeyExchangeModes,
            ExtensionSpec::SupportedVersions,
            ExtensionSpec::CompressCertificate,
            ExtensionSpec::Grease,
            ExtensionSpec::Padding,
        ],
        supported_groups: vec![GREASE_SG, X25519, CURVE_P256, CURVE_P384, SECP521R1],
        signature_algorithms: vec![
            ss::ECDSA_WITH_P256_AND_SHA256,
            ss::RSA_PSS_RSAE_SHA256,
            ss::RSA_PKCS1_SHA256,
            ss::ECDSA_WITH_P384_AND_SHA384,
            ss::ECDSA_SHA1,
            ss::RSA_PSS_RSAE_SHA384,
            ss::RSA_PKCS1_SHA384,
            ss::RSA_PSS_RSAE_SHA512,
            ss::RSA_PKCS1_SHA512,
            ss::PKCS1_WITH_SHA1,
        ],
        delegated_credentials: vec![],
        alpn_protocols: vec!["h2".to_string(), "http/1.1".to_string()],
        key_shares: vec![
            KeyShareOffer { group: GREASE_SG, key_len: 1 },
            KeyShareOffer { group: X25519, key_len: 32 },
        ],
        supported_versions: vec![GREASE_SG, VERSION_TLS13, VERSION_TLS12],
        cert_compression: vec![CERT_COMPRESSION_ZLIB],
        record_size_limit: None,
        session_id_length: 32,
    }
}

fn safari_h2() -> H2Spec {
    H2Spec {
        settings: vec![
            (H2Setting::EnablePush.as_u16(), 0),
            (H2Setting::InitialWindowSize.as_u16(), 2097152),
            (H2Setting::MaxConcurrentStreams.as_u16(), 100),
        ],
        connection_window_update: 10485760,
        priority_frames: vec![],
        header_priority: Some(PriorityParam {
            stream_dependency: 0,
            exclusive: false,
            weight: 254,
        }),
        pseudo_header_order: [
            PseudoHeader::Method,
            PseudoHeader::Scheme,
            PseudoHeader::Path,
            PseudoHeader::Authority,
        ],
    }
}

fn safari_h3() -> H3Spec {
    H3Spec {
        transport: QuicTransportParams {
            max_idle_timeout: Duration::from_secs(30),
            max_udp_payload_size: 1452,
            initial_max_data: 1_572_864,
            initial_max_stream_data_bidi_local: 983_040,
            initial_max_stream_data_bidi_remote: 983_040,
            initial_max_stream_data_uni: 983_040,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            active_connection_id_limit: 4,
            max_datagram_frame_size: None,
            grease_quic_bit: false,
        },
        settings: H3Settings {
            qpack_max_table_capacity: 4096,
            qpack_blocked_streams: 100,
            h3_datagram: false,
            grease_setting: false,
        },
        initial_packet_padding: 1200,
    }
}

fn safari_headers(user_agent: &'static str) -> HeaderTemplate {
    HeaderTemplate {
        user_agent,
        sec_ch_ua: "",
        accept_language: "en-US,en;q=0.9",
        accept_encoding: "gzip, deflate, br",
        // Safari 模板不含 Sec-Fetch-*（emit_sec_fetch=false 时槽位也不会出现）
        slots: vec![
            HeaderSlot { name: "Host", value: SlotValue::Host },
            HeaderSlot { name: "Accept", value: SlotValue::Accept },
            HeaderSlot { name: "User-Agent", value: SlotValue::UserAgent },
            HeaderSlot { name: "Accept-Language", value: SlotValue::AcceptLanguage },
            HeaderSlot { name: "Referer", value: SlotValue::Referer },
            HeaderSlot { name: "Accept-Encoding", value: SlotValue::AcceptEncoding },
            HeaderSlot { name: "", value: SlotValue::Extras },
            HeaderSlot { name: "Cookie", value: SlotValue::Cookie },
        ],
        emit_sec_fetch: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preset::is_grease_value;

    #[test]
    fn test_chrome_ja4_counts() {
        // 15 套件（去 GREASE）、16 扩展（去 GREASE）、ALPN h2
        let ja4 = chrome_tls().ja4(true);
        assert!(ja4.starts_with("t13d1516h2_"), "{ja4}");
    }

    #[test]
    fn test_firefox_no_grease() {
        let tls = firefox_tls();
        assert!(!tls.cipher_suites.iter().any(|&c| is_grease_value(c)));
        assert!(!tls.extensions.iter().any(|e| matches!(e, ExtensionSpec::Grease)));
    }

    #[test]
    fn test_chrome_key_share_order_mlkem_first() {
        let tls = chrome_tls();
        let real: Vec<u16> = tls
            .key_shares
            .iter()
            .map(|k| k.group)
            .filter(|&g| !is_grease_value(g))
            .collect();
        assert_eq!(real, vec![X25519_MLKEM768, X25519]);
    }

    #[test]
    fn test_safari_template_omits_sec_fetch() {
        let p = safari_18();
        assert!(!p.headers.emit_sec_fetch);
        assert!(!p.headers.declares("sec-fetch-mode"));
    }

    #[test]
    fn test_ios_chrome_uses_webkit_stack() {
        let ios = chrome_mobile_ios();
        let safari = safari_18();
        assert_eq!(ios.tls.cipher_suites, safari.tls.cipher_suites);
        assert!(ios.headers.user_agent.contains("CriOS"));
    }

    #[test]
    fn test_mobile_platforms() {
        assert!(platform_android().mobile);
        assert!(platform_ios().mobile);
        assert!(!platform_linux().mobile);
    }
}
