//! Per-connection session state machine (component C5, spec §4.5):
//! greeting, optional authentication, then a read-dispatch-write loop
//! until the client disconnects, `CMD_shutdown` is received, or a
//! protocol/transport error tears the connection down.

use crate::auth::Auth;
use crate::detach;
use crate::engine::{Engine, ParseStatus};
use crate::fileio::{FileHandle, DEFAULT_READ_LEN};
use crate::transport::ClientStream;
use crate::wire::*;
use crate::workdir::WorkDir;
use crate::Config;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{info, warn};

/// What the session loop decided when it returned.
#[derive(Debug, Default)]
pub struct SessionOutcome {
    /// `CMD_shutdown` was received; the listener should stop accepting
    /// and the process should exit (spec §4.5, §5 "Cancellation").
    pub shutdown_requested: bool,
}

pub struct Session<E: Engine> {
    auth: Auth,
    engine: E,
    file: FileHandle,
    workdir: Option<WorkDir>,
    fileio_enabled: bool,
    max_in_buf: usize,
    snd_bs: u64,
    max_send_buf_size: u64,
    peer_ip: IpAddr,
}

impl<E: Engine> Session<E> {
    pub fn new(config: &Config, engine: E, peer_ip: IpAddr, workdir: Option<WorkDir>) -> Self {
        let auth = Auth::new(config.auth, config.plaintext, config.pwdfile.clone());
        Session {
            auth,
            engine,
            file: FileHandle::new(),
            workdir,
            fileio_enabled: config.fileio,
            max_in_buf: config.max_in_buf,
            snd_bs: config.snd_bs as u64,
            max_send_buf_size: config.max_send_buf_size as u64,
            peer_ip,
        }
    }

    /// Resolve a client-supplied path against the connection's sandbox,
    /// when one is configured (spec §4.2).
    fn resolve_path(&self, client_path: &str) -> std::path::PathBuf {
        match &self.workdir {
            Some(wd) => wd.resolve(client_path),
            None => std::path::PathBuf::from(client_path),
        }
    }

    /// Drive the session to completion on `stream`, which may be swapped
    /// out mid-call by a detach/resume cycle (spec §4.6). The connection's
    /// sandbox directory, if any, is removed on every exit path (spec
    /// §4.2: "best-effort; failures are ignored").
    pub async fn run(mut self, stream: &mut ClientStream) -> Result<SessionOutcome, WireError> {
        let result = self.run_inner(stream).await;
        if let Some(workdir) = self.workdir.take() {
            workdir.remove().await;
        }
        result
    }

    async fn run_inner(&mut self, stream: &mut ClientStream) -> Result<SessionOutcome, WireError> {
        let greeting = crate::auth::build_greeting(self.auth.required().then_some(&self.auth));
        write_frame(stream, &greeting).await?;

        loop {
            let (cmd, payload) = match read_frame(stream).await? {
                Some(f) => f,
                None => return Ok(SessionOutcome::default()),
            };

            if self.max_in_buf > 0 && payload.len() >= self.max_in_buf {
                write_frame(stream, &encode_err(ERR_DATA_OVERFLOW)).await?;
                continue;
            }

            if !self.auth.is_authed() {
                match cmd {
                    CMD_LOGIN => {
                        let reply = self.handle_login(&payload);
                        let terminate = reply.is_err();
                        write_frame(stream, &reply.unwrap_or_else(|f| f)).await?;
                        if terminate {
                            return Ok(SessionOutcome::default());
                        }
                        continue;
                    }
                    CMD_SHUTDOWN => {
                        write_frame(stream, &encode_ok(0x0001, &[])).await?;
                        return Ok(SessionOutcome { shutdown_requested: true });
                    }
                    _ => {
                        write_frame(stream, &encode_err(ERR_AUTH_FAILED)).await?;
                        return Ok(SessionOutcome::default());
                    }
                }
            }

            match cmd {
                CMD_LOGIN => {
                    let reply = self.handle_login(&payload).unwrap_or_else(|f| f);
                    write_frame(stream, &reply).await?;
                }
                CMD_VOID_EVAL => {
                    let reply = self.eval_common(&payload, false);
                    write_frame(stream, &reply).await?;
                }
                CMD_EVAL => {
                    let reply = self.eval_common(&payload, true);
                    write_frame(stream, &reply).await?;
                }
                CMD_DETACHED_VOID_EVAL => {
                    self.handle_detached_void_eval(&payload, stream).await?;
                }
                CMD_ASSIGN_SEXP => {
                    let reply = self.handle_assign(&payload, true);
                    write_frame(stream, &reply).await?;
                }
                CMD_SET_SEXP => {
                    let reply = self.handle_assign(&payload, false);
                    write_frame(stream, &reply).await?;
                }
                CMD_OPEN_FILE => {
                    let reply = self.handle_open(&payload, false).await;
                    write_frame(stream, &reply).await?;
                }
                CMD_CREATE_FILE => {
                    let reply = self.handle_open(&payload, true).await;
                    write_frame(stream, &reply).await?;
                }
                CMD_CLOSE_FILE => {
                    self.file.close();
                    write_frame(stream, &encode_ok(0x0001, &[])).await?;
                }
                CMD_READ_FILE => {
                    let reply = self.handle_read_file(&payload).await;
                    write_frame(stream, &reply).await?;
                }
                CMD_WRITE_FILE => {
                    let reply = self.handle_write_file(&payload).await;
                    write_frame(stream, &reply).await?;
                }
                CMD_REMOVE_FILE => {
                    let reply = self.handle_remove_file(&payload).await;
                    write_frame(stream, &reply).await?;
                }
                CMD_SET_BUFFER_SIZE => {
                    let reply = self.handle_set_buffer_size(&payload);
                    write_frame(stream, &reply).await?;
                }
                CMD_DETACH_SESSION => {
                    self.handle_detach(stream).await?;
                }
                CMD_SHUTDOWN => {
                    write_frame(stream, &encode_ok(0x0001, &[])).await?;
                    return Ok(SessionOutcome { shutdown_requested: true });
                }
                _ => {
                    write_frame(stream, &encode_err(ERR_INV_CMD)).await?;
                }
            }
        }
    }

    /// `Ok` carries the success reply; `Err` carries the failure reply
    /// and signals the connection must be torn down (spec §4.4 item 4).
    fn handle_login(&mut self, payload: &[u8]) -> Result<Vec<u8>, Vec<u8>> {
        let Some(param) = first_param(payload) else {
            return Err(encode_err(ERR_AUTH_FAILED));
        };
        let credentials = decode_string_param(param.body(payload));
        match self.auth.check_login(&credentials) {
            Ok(()) => Ok(encode_ok(0x0001, &[])),
            Err(code) => Err(encode_err(code)),
        }
    }

    fn parse_with_retry(&self, src: &str) -> crate::engine::ParseResult<E::Expr> {
        let mut segments = count_segments(src);
        loop {
            let result = self.engine.parse(src, segments);
            if !result.status.should_retry() || segments <= 1 {
                return result;
            }
            segments -= 1;
        }
    }

    fn eval_common(&mut self, payload: &[u8], want_value: bool) -> Vec<u8> {
        let Some(param) = first_param(payload) else {
            return encode_err(ERR_INV_PAR);
        };
        let src = decode_string_param(param.body(payload));
        match self.evaluate(&src) {
            Ok(Some(value)) if want_value => self.encode_value_reply(value),
            Ok(_) => encode_ok(0x0001, &[]),
            Err(reply) => reply,
        }
    }

    /// Parse and evaluate every top-level expression in `src` in order,
    /// returning the last successfully evaluated value (spec §4.5
    /// "Multi-expression evaluation").
    fn evaluate(&mut self, src: &str) -> Result<Option<Value>, Vec<u8>> {
        let parsed = self.parse_with_retry(src);
        if parsed.status != ParseStatus::Ok {
            return Err(encode_err(ERR_INV_PAR));
        }
        let mut last = None;
        for expr in &parsed.exprs {
            match self.engine.try_eval(expr) {
                Ok(v) => last = Some(v),
                Err(code) => return Err(encode_err(negate_engine_code(code))),
            }
        }
        Ok(last)
    }

    fn encode_value_reply(&self, value: Value) -> Vec<u8> {
        let sexp = Sexp::new(value);
        let needed = storage_size(&sexp) + 64;
        if needed > self.snd_bs {
            if self.max_send_buf_size != 0 && needed > self.max_send_buf_size {
                let clamped = needed.min(0xffff_ffff) as u32;
                return encode_err_with_body(ERR_OBJECT_TOO_BIG, &clamped.to_le_bytes());
            }
            // Growth permitted: the reply buffer is a plain Vec and grows
            // on demand for this one oversized reply, then is dropped.
        }
        encode_ok(0x0001, &[Param::Sexp(sexp)])
    }

    fn handle_assign(&mut self, payload: &[u8], parse_name_as_expr: bool) -> Vec<u8> {
        let params = match iter_params(payload, false) {
            Ok(p) => p,
            Err(_) => return encode_err(ERR_INV_PAR),
        };
        if params.len() < 2 {
            return encode_err(ERR_INV_PAR);
        }
        let name = decode_string_param(params[0].body(payload));
        let value = match params[1].type_byte {
            DT_SEXP => match decode_sexp_param(params[1].body(payload)) {
                Ok(sexp) => sexp.value,
                Err(_) => return encode_err(ERR_INV_PAR),
            },
            _ => Value::Str(decode_string_param(params[1].body(payload))),
        };

        let target = if parse_name_as_expr {
            let parsed = self.parse_with_retry(&name);
            if parsed.status != ParseStatus::Ok || parsed.exprs.len() != 1 {
                return encode_err(ERR_INV_PAR);
            }
            parsed.exprs[0].clone()
        } else {
            self.engine.install(&name)
        };
        self.engine.bind(&target, value);
        encode_ok(0x0001, &[])
    }

    async fn handle_open(&mut self, payload: &[u8], create: bool) -> Vec<u8> {
        if !self.fileio_enabled {
            return encode_err(ERR_ACCESS_DENIED);
        }
        let Some(param) = first_param(payload) else {
            return encode_err(ERR_INV_PAR);
        };
        let path = self.resolve_path(&decode_string_param(param.body(payload)));
        let result =
            if create { self.file.create_write(&path).await } else { self.file.open_read(&path).await };
        match result {
            Ok(()) => encode_ok(0x0001, &[]),
            Err(_) => encode_err(ERR_IO_ERROR),
        }
    }

    async fn handle_read_file(&mut self, payload: &[u8]) -> Vec<u8> {
        if !self.fileio_enabled {
            return encode_err(ERR_ACCESS_DENIED);
        }
        if !self.file.is_open() {
            return encode_err(ERR_NOT_OPEN);
        }
        let len = first_param(payload)
            .and_then(|p| LittleEndianU32::read(p.body(payload)))
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_READ_LEN);
        match self.file.read(len).await {
            Ok(data) => encode_ok(0x0001, &[Param::ByteStream(data)]),
            Err(_) => encode_err(ERR_IO_ERROR),
        }
    }

    async fn handle_write_file(&mut self, payload: &[u8]) -> Vec<u8> {
        if !self.fileio_enabled {
            return encode_err(ERR_ACCESS_DENIED);
        }
        if !self.file.is_open() {
            return encode_err(ERR_NOT_OPEN);
        }
        let Some(param) = first_param(payload) else {
            return encode_err(ERR_INV_PAR);
        };
        match self.file.write(param.body(payload)).await {
            Ok(()) => encode_ok(0x0001, &[]),
            Err(_) => encode_err(ERR_IO_ERROR),
        }
    }

    async fn handle_remove_file(&mut self, payload: &[u8]) -> Vec<u8> {
        if !self.fileio_enabled {
            return encode_err(ERR_ACCESS_DENIED);
        }
        let Some(param) = first_param(payload) else {
            return encode_err(ERR_INV_PAR);
        };
        let path = self.resolve_path(&decode_string_param(param.body(payload)));
        match crate::fileio::remove_file(&path).await {
            Ok(()) => encode_ok(0x0001, &[]),
            Err(_) => encode_err(ERR_IO_ERROR),
        }
    }

    fn handle_set_buffer_size(&mut self, payload: &[u8]) -> Vec<u8> {
        const MIN_SEND_BUF: u64 = 32 * 1024;
        let Some(bytes) = first_param(payload).and_then(|p| LittleEndianU32::read(p.body(payload)))
        else {
            return encode_err(ERR_INV_PAR);
        };
        if bytes != 0 {
            self.snd_bs = (bytes as u64).max(MIN_SEND_BUF);
        }
        encode_ok(0x0001, &[])
    }

    async fn handle_detach(&mut self, stream: &mut ClientStream) -> Result<(), WireError> {
        match self.do_detach(stream).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "detach failed, session left in prior state");
                write_frame(stream, &encode_err(ERR_DETACH_FAILED)).await
            }
        }
    }

    async fn handle_detached_void_eval(
        &mut self,
        payload: &[u8],
        stream: &mut ClientStream,
    ) -> Result<(), WireError> {
        let Some(param) = first_param(payload) else {
            return write_frame(stream, &encode_err(ERR_INV_PAR)).await;
        };
        let src = decode_string_param(param.body(payload));
        let parsed = self.parse_with_retry(&src);
        if parsed.status != ParseStatus::Ok {
            return write_frame(stream, &encode_err(ERR_INV_PAR)).await;
        }

        if let Err(e) = self.do_detach(stream).await {
            warn!(error = %e, "detach failed, session left in prior state");
            return write_frame(stream, &encode_err(ERR_DETACH_FAILED)).await;
        }

        let mut last = None;
        for expr in &parsed.exprs {
            match self.engine.try_eval(expr) {
                Ok(v) => last = Some(v),
                Err(code) => {
                    return write_frame(stream, &encode_err(negate_engine_code(code))).await;
                }
            }
        }
        let _ = last;
        info!("detached evaluation complete, replying on resumed socket");
        write_frame(stream, &encode_ok(0x0001, &[])).await
    }

    async fn do_detach(&mut self, stream: &mut ClientStream) -> std::io::Result<()> {
        let handoff = detach::prepare(self.peer_ip).await?;
        let port = handoff.port;
        let key = handoff.key;
        let reply =
            encode_ok(0x0001, &[Param::Int(port as u32), Param::ByteStream(key.to_vec())]);
        write_frame(stream, &reply).await.map_err(std::io::Error::other)?;

        let new_stream = detach::await_resume(handoff.listener, self.peer_ip, &key).await?;
        new_stream.set_nodelay(true).ok();
        *stream = ClientStream::Tcp(new_stream);
        Ok(())
    }
}

fn first_param(payload: &[u8]) -> Option<ParsedParam> {
    iter_params(payload, false).ok()?.into_iter().next()
}

fn count_segments(src: &str) -> usize {
    src.split(|c| c == ';' || c == '\n')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .count()
        .max(1)
}

/// Engine error codes are reported on the wire as the negated code in the
/// status byte (spec §7, §6.5).
fn negate_engine_code(code: i32) -> u8 {
    (-code) as u8
}

struct LittleEndianU32;
impl LittleEndianU32 {
    fn read(body: &[u8]) -> Option<u32> {
        if body.len() < 4 {
            return None;
        }
        Some(u32::from_le_bytes([body[0], body[1], body[2], body[3]]))
    }
}

/// Create the per-connection sandbox, run the session, then remove the
/// sandbox on the way out (spec §4.2).
pub async fn handle_connection<E: Engine>(
    mut stream: ClientStream,
    config: Arc<Config>,
    engine: E,
    peer_addr: SocketAddr,
    conn_index: u64,
) -> SessionOutcome {
    stream.set_nodelay();
    let workdir = match WorkDir::create(config.workdir.as_deref(), conn_index).await {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, "failed to create connection workdir");
            None
        }
    };

    let session = Session::new(&config, engine, peer_addr.ip(), workdir);
    match session.run(&mut stream).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(peer = %peer_addr, error = %e, "session ended with error");
            SessionOutcome::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ArithEngine;

    fn session(config: &Config) -> Session<ArithEngine> {
        Session::new(config, ArithEngine::new(), IpAddr::from([127, 0, 0, 1]), None)
    }

    #[test]
    fn count_segments_splits_on_semicolon_and_newline() {
        assert_eq!(count_segments("1+1; 2+2\n3+3"), 3);
        assert_eq!(count_segments("  "), 1);
        assert_eq!(count_segments("just one"), 1);
    }

    #[test]
    fn negate_engine_code_matches_wire_convention() {
        assert_eq!(negate_engine_code(1), 0xff);
        assert_eq!(negate_engine_code(2), 0xfe);
    }

    #[test]
    fn evaluate_runs_every_segment_and_returns_the_last_value() {
        let config = Config::default();
        let mut s = session(&config);
        let result = s.evaluate("1 + 1; 2 * 3");
        assert!(result.is_ok());
    }

    #[test]
    fn evaluate_reports_inv_par_on_malformed_source() {
        let config = Config::default();
        let mut s = session(&config);
        let result = s.evaluate("1 + * 2");
        assert!(result.is_err());
    }

    #[test]
    fn resolve_path_is_bare_when_no_workdir_is_configured() {
        let config = Config::default();
        let s = session(&config);
        assert_eq!(s.resolve_path("foo.txt"), std::path::PathBuf::from("foo.txt"));
    }

    #[test]
    fn oversized_reply_is_reported_when_it_exceeds_the_hard_cap() {
        let mut config = Config::default();
        config.snd_bs = 8;
        config.max_send_buf_size = 16;
        let s = session(&config);
        let reply = s.encode_value_reply(Value::Str("x".repeat(64)));
        let (cmd, payload) = split_reply(&reply);
        assert_eq!(cmd & RESP_ERR, RESP_ERR);
        assert_eq!((cmd >> 24) as u8, ERR_OBJECT_TOO_BIG);
        assert_eq!(payload.len(), 4);
    }

    #[test]
    fn reply_growth_is_allowed_when_no_hard_cap_is_set() {
        let mut config = Config::default();
        config.snd_bs = 8;
        config.max_send_buf_size = 0;
        let s = session(&config);
        let reply = s.encode_value_reply(Value::Str("x".repeat(64)));
        let (cmd, _payload) = split_reply(&reply);
        assert_eq!(cmd, RESP_OK);
    }

    fn split_reply(frame: &[u8]) -> (u32, &[u8]) {
        use byteorder::{ByteOrder, LittleEndian};
        (LittleEndian::read_u32(&frame[0..4]), &frame[16..])
    }
}
