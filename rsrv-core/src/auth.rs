//! Challenge generation and credential verification (component C4, spec
//! §4.4), plus the handshake capability encoding (spec §6.1).

use crate::wire::ERR_AUTH_FAILED;
use rand::Rng;
use std::path::Path;
use tracing::warn;

/// Alphabet salts and the hashed-login challenge are drawn from (spec
/// GLOSSARY "Salt").
const CODE64: &[u8; 64] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauth,
    AwaitingCredentials,
    Authed,
}

/// Per-connection authentication context.
pub struct Auth {
    required: bool,
    plaintext_allowed: bool,
    pwdfile: Option<std::path::PathBuf>,
    salt: String,
    state: AuthState,
}

impl Auth {
    /// `salt` is freshly generated per connection at greeting time (spec
    /// §3 "Connection state"); pass `None` when `required` is false.
    pub fn new(required: bool, plaintext_allowed: bool, pwdfile: Option<std::path::PathBuf>) -> Self {
        let salt = generate_salt();
        Auth {
            required,
            plaintext_allowed,
            pwdfile,
            salt,
            state: if required { AuthState::Unauth } else { AuthState::Authed },
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn is_authed(&self) -> bool {
        self.state == AuthState::Authed
    }

    pub fn salt(&self) -> &str {
        &self.salt
    }

    pub fn required(&self) -> bool {
        self.required
    }

    pub fn plaintext_allowed(&self) -> bool {
        self.plaintext_allowed
    }

    /// `CMD_login`'s single `DT_STRING` parameter is `"login\npassword"`
    /// (spec §4.4). Transitions to `Authed` on success; the caller is
    /// responsible for closing the connection on failure (spec: "reply
    /// `ERR_auth_failed` and close the connection").
    pub fn check_login(&mut self, credentials: &str) -> Result<(), u8> {
        let Some((login, password)) = credentials.split_once('\n') else {
            return Err(ERR_AUTH_FAILED);
        };
        if self.verify(login, password) {
            self.state = AuthState::Authed;
            Ok(())
        } else {
            Err(ERR_AUTH_FAILED)
        }
    }

    fn verify(&self, login: &str, supplied: &str) -> bool {
        let Some(pwdfile) = &self.pwdfile else {
            // No password file configured: accept unconditionally (spec §4.4.1).
            return true;
        };
        let Ok(contents) = std::fs::read_to_string(pwdfile) else {
            warn!(path = %pwdfile.display(), "failed to read password file");
            return false;
        };
        for line in contents.lines() {
            let Some((file_login, file_password)) = split_credentials_line(line) else {
                continue;
            };
            if file_login != login {
                continue;
            }
            if self.plaintext_allowed && file_password == supplied {
                return true;
            }
            if let Ok(hashed) = pwhash::unix_crypt::crypt(file_password, &self.salt[1..3]) {
                if hashed == supplied {
                    return true;
                }
            }
            return false;
        }
        false
    }
}

fn split_credentials_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let mut parts = line.splitn(2, char::is_whitespace);
    let login = parts.next()?;
    let password = parts.next()?.trim_start();
    Some((login, password))
}

/// Two printable characters from `CODE64`, prefixed with `'K'` and
/// suffixed with `' '` to form the 4-byte `ARuc` argument (spec §6.1).
fn generate_salt() -> String {
    let mut rng = rand::thread_rng();
    let c1 = CODE64[rng.gen_range(0..64)] as char;
    let c2 = CODE64[rng.gen_range(0..64)] as char;
    format!("K{c1}{c2} ")
}

/// Build the 32-byte greeting (spec §6.1). When `auth` is `Some`, the
/// trailing 16 bytes (offset 16..32) are overwritten with capability
/// tokens; otherwise the plain dashed trailer is sent.
pub fn build_greeting(auth: Option<&Auth>) -> [u8; 32] {
    let mut buf = [0u8; 32];
    buf[0..12].copy_from_slice(b"Rsrv0102QAP1");
    buf[12..32].copy_from_slice(b"\r\n\r\n--------------\r\n");
    if let Some(auth) = auth {
        buf[16..20].copy_from_slice(b"ARuc");
        buf[20..24].copy_from_slice(auth.salt().as_bytes());
        if auth.plaintext_allowed() {
            buf[24..28].copy_from_slice(b"ARpt");
        }
    }
    buf
}

pub fn pwdfile_exists(path: &Path) -> bool {
    path.exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_pwdfile_accepts_unconditionally() {
        let mut auth = Auth::new(true, true, None);
        assert!(auth.check_login("alice\nanything").is_ok());
        assert!(auth.is_authed());
    }

    #[test]
    fn plaintext_login_matches_pwdfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pwd");
        std::fs::write(&path, "alice pw1\nbob pw2\n").unwrap();
        let mut auth = Auth::new(true, true, Some(path));
        assert!(auth.check_login("alice\npw1").is_ok());
    }

    #[test]
    fn plaintext_login_rejects_wrong_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pwd");
        std::fs::write(&path, "alice pw1\n").unwrap();
        let mut auth = Auth::new(true, true, Some(path));
        assert!(auth.check_login("alice\nwrong").is_err());
    }

    #[test]
    fn unknown_login_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pwd");
        std::fs::write(&path, "alice pw1\n").unwrap();
        let mut auth = Auth::new(true, true, Some(path));
        assert!(auth.check_login("mallory\npw1").is_err());
    }

    #[test]
    fn greeting_without_auth_is_plain() {
        let g = build_greeting(None);
        assert_eq!(&g[0..12], b"Rsrv0102QAP1");
        assert_eq!(&g[16..20], b"----");
    }

    #[test]
    fn greeting_with_auth_carries_capability() {
        let auth = Auth::new(true, true, None);
        let g = build_greeting(Some(&auth));
        assert_eq!(&g[16..20], b"ARuc");
        assert_eq!(&g[24..28], b"ARpt");
    }
}
