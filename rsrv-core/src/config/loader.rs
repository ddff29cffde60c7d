use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::error::{Result, RsrvError};

/// Load and validate a TOML configuration file (primary format).
pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(p)
        .map_err(|e| RsrvError::Config(format!("failed to read config file: {e}")))?;
    let cfg: Config =
        toml::from_str(&txt).map_err(|e| RsrvError::Config(format!("failed to parse config: {e}")))?;
    validate_config(&cfg)?;
    Ok(cfg)
}

/// Parse the original line-oriented `key <sep> value` config format (spec
/// §6.6), where `sep` is whitespace, `=` or `:`, applying each recognized
/// key onto a default [`Config`]. Unknown keys are ignored, matching the
/// original tool's permissive behavior.
pub fn load_legacy_str(text: &str) -> Result<Config> {
    let mut cfg = Config::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = split_legacy_line(line) else { continue };
        apply_legacy_key(&mut cfg, key, value)?;
    }
    validate_config(&cfg)?;
    Ok(cfg)
}

fn split_legacy_line(line: &str) -> Option<(&str, &str)> {
    let sep_pos = line.find([' ', '\t', '=', ':'])?;
    let key = line[..sep_pos].trim();
    let value = line[sep_pos + 1..].trim_start_matches(['=', ':', ' ', '\t']).trim();
    if key.is_empty() {
        None
    } else {
        Some((key, value))
    }
}

fn apply_legacy_key(cfg: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "workdir" => cfg.workdir = if value.is_empty() { None } else { Some(value.into()) },
        "pwdfile" => cfg.pwdfile = if value.is_empty() { None } else { Some(value.into()) },
        "remote" => cfg.remote = parse_bool(value),
        "auth" => cfg.auth = parse_bool(value),
        "plaintext" => cfg.plaintext = parse_bool(value),
        "fileio" => cfg.fileio = parse_bool(value),
        "socket" => cfg.socket = if value.is_empty() { None } else { Some(value.into()) },
        "maxinbuf" => {
            cfg.max_in_buf = value
                .parse::<usize>()
                .map_err(|_| RsrvError::Config(format!("invalid maxinbuf: {value}")))?
                * 1024
        }
        "maxsendbuf" => {
            cfg.max_send_buf_size = value
                .parse::<usize>()
                .map_err(|_| RsrvError::Config(format!("invalid maxsendbuf: {value}")))?
                * 1024
        }
        "uid" => cfg.uid = Some(parse_num(value)?),
        "gid" => cfg.gid = Some(parse_num(value)?),
        "source" => cfg.source = Some(value.into()),
        "eval" => cfg.eval = Some(value.into()),
        "allow" => {
            cfg.allow = value
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect()
        }
        "port" => cfg.port = parse_num(value)?,
        _ => {}
    }
    Ok(())
}

fn parse_bool(v: &str) -> bool {
    matches!(v, "1" | "true" | "yes" | "on")
}

fn parse_num<T: std::str::FromStr>(v: &str) -> Result<T> {
    v.parse().map_err(|_| RsrvError::Config(format!("invalid numeric value: {v}")))
}

fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.auth && !cfg.plaintext {
        match &cfg.pwdfile {
            Some(path) if !path.exists() => {
                return Err(RsrvError::Config(format!(
                    "password file not found: {}",
                    path.display()
                )))
            }
            _ => {}
        }
    }
    if let Some(workdir) = &cfg.workdir {
        if workdir.exists() && !workdir.is_dir() {
            return Err(RsrvError::Config(format!(
                "workdir exists and is not a directory: {}",
                workdir.display()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_parses_whitespace_and_equals_and_colon_separators() {
        let text = "workdir /tmp/rsrv\nport=6312\nauth: true\n";
        let cfg = load_legacy_str(text).unwrap();
        assert_eq!(cfg.workdir, Some("/tmp/rsrv".into()));
        assert_eq!(cfg.port, 6312);
        assert!(cfg.auth);
    }

    #[test]
    fn legacy_ignores_comments_and_blank_lines() {
        let text = "# a comment\n\nremote yes\n";
        let cfg = load_legacy_str(text).unwrap();
        assert!(cfg.remote);
    }

    #[test]
    fn toml_roundtrips_defaults() {
        let cfg = load_from_toml_str("port = 6399\n").unwrap();
        assert_eq!(cfg.port, 6399);
        assert!(!cfg.auth);
        assert_eq!(cfg.max_in_buf, 256 * 1024 * 1024);
    }

    fn load_from_toml_str(s: &str) -> Result<Config> {
        let cfg: Config =
            toml::from_str(s).map_err(|e| RsrvError::Config(format!("parse: {e}")))?;
        validate_config(&cfg)?;
        Ok(cfg)
    }
}
