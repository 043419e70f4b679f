//! TLS 密钥日志
//!
//! `SSLKEYLOGFILE` 指向的文件以 0600 权限追加 NSS key log 格式的行；
//! 环境变量缺省时关闭。会话也可以显式挂一个 writer（抓包联调用）。
//! 同一个 sink 同时喂给 TCP-TLS 与 QUIC 两侧的 rustls 配置。

use log::warn;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// 密钥日志 sink
pub struct KeyLogSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for KeyLogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyLogSink")
    }
}

impl KeyLogSink {
    /// 显式 writer
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Arc<Self> {
        Arc::new(Self { writer: Mutex::new(writer) })
    }

    /// 以 0600 打开（不存在则创建）日志文件
    pub fn open(path: &Path) -> std::io::Result<Arc<Self>> {
        let mut opts = OpenOptions::new();
        opts.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let file = opts.open(path)?;
        Ok(Arc::new(Self { writer: Mutex::new(Box::new(file)) }))
    }

    /// 按 `SSLKEYLOGFILE` 环境变量构造；未设置返回 None
    pub fn from_env() -> Option<Arc<Self>> {
        let path = std::env::var_os("SSLKEYLOGFILE")?;
        match Self::open(Path::new(&path)) {
            Ok(sink) => Some(sink),
            Err(e) => {
                warn!("SSLKEYLOGFILE 打开失败: {e}");
                None
            }
        }
    }

    fn write_line(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        let mut line = String::with_capacity(label.len() + client_random.len() * 2 + secret.len() * 2 + 3);
        line.push_str(label);
        line.push(' ');
        for b in client_random {
            line.push_str(&format!("{b:02x}"));
        }
        line.push(' ');
        for b in secret {
            line.push_str(&format!("{b:02x}"));
        }
        line.push('\n');
        if let Ok(mut w) = self.writer.lock() {
            let _ = w.write_all(line.as_bytes());
        }
    }
}

impl rustls::KeyLog for KeyLogSink {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        self.write_line(label, client_random, secret);
    }

    fn will_log(&self, _label: &str) -> bool {
        true
    }
}
