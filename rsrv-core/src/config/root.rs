use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;

/// Main configuration structure (spec §6.6 "Recognized configuration
/// keys").
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// TCP port to listen on, ignored when `socket` is set.
    /// Default: 6311.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Allow non-loopback clients to connect over TCP.
    /// Default: false (loopback only).
    #[serde(default)]
    pub remote: bool,
    /// Use a local (Unix domain) socket at this path instead of TCP.
    #[serde(default)]
    pub socket: Option<PathBuf>,
    /// Root directory under which a per-connection scratch directory is
    /// created (`<workdir>/conn<N>`). `None` disables the sandbox.
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// Require authentication before any command but `CMD_login`.
    #[serde(default)]
    pub auth: bool,
    /// Permit plaintext password comparison (`ARpt` capability).
    #[serde(default)]
    pub plaintext: bool,
    /// Path to the `login<WS>password` credentials file. `None` means
    /// "accept unconditionally" once authentication is attempted.
    #[serde(default)]
    pub pwdfile: Option<PathBuf>,
    /// Enable file transfer commands (`CMD_openFile` and friends).
    #[serde(default = "default_true")]
    pub fileio: bool,
    /// IP allowlist applied when not `remote` (default: loopback only).
    #[serde(default = "default_allow")]
    pub allow: Vec<IpAddr>,
    /// Initial input buffer size, bytes.
    #[serde(default = "default_in_buf")]
    pub in_buf: usize,
    /// Ceiling the input buffer may grow to; 0 means unlimited.
    #[serde(default = "default_max_in_buf")]
    pub max_in_buf: usize,
    /// Initial send buffer size, bytes.
    #[serde(default = "default_snd_bs")]
    pub snd_bs: usize,
    /// Ceiling the send buffer may temporarily grow to; 0 means unlimited.
    #[serde(default)]
    pub max_send_buf_size: usize,
    /// Drop privileges to this uid after bind (`cfg(unix)` only).
    #[serde(default)]
    pub uid: Option<u32>,
    /// Drop privileges to this gid after bind (`cfg(unix)` only).
    #[serde(default)]
    pub gid: Option<u32>,
    /// Path to a source file evaluated once at startup, before accept.
    #[serde(default)]
    pub source: Option<PathBuf>,
    /// Expression string evaluated once at startup, after `source`.
    #[serde(default)]
    pub eval: Option<String>,
}

fn default_port() -> u16 {
    6311
}

fn default_true() -> bool {
    true
}

fn default_allow() -> Vec<IpAddr> {
    vec![IpAddr::from([127, 0, 0, 1])]
}

fn default_in_buf() -> usize {
    32 * 1024
}

fn default_max_in_buf() -> usize {
    256 * 1024 * 1024
}

fn default_snd_bs() -> usize {
    2 * 1024 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: default_port(),
            remote: false,
            socket: None,
            workdir: None,
            auth: false,
            plaintext: false,
            pwdfile: None,
            fileio: default_true(),
            allow: default_allow(),
            in_buf: default_in_buf(),
            max_in_buf: default_max_in_buf(),
            snd_bs: default_snd_bs(),
            max_send_buf_size: 0,
            uid: None,
            gid: None,
            source: None,
            eval: None,
        }
    }
}
