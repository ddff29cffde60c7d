//! Main accept loop, IP allowlist and per-connection isolation (component
//! C7, spec §4.7).
//!
//! Each accepted connection is isolated by handing it a *fresh* `Engine`
//! instance (spec §4.7 "Isolation model": "two concurrent sessions must
//! not observe each other's global bindings") rather than forking a
//! process, per the spec's explicit allowance for task/thread-based
//! implementations that preserve the isolation contract.

use crate::engine::Engine;
use crate::net::bind_tcp_listener;
use crate::transport::ClientStream;
use crate::{session, Config};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{info, warn};

/// Monotonically increasing per-connection index (spec §3 "Connection
/// state": "Unique connection index N, monotonically increasing in the
/// listener").
#[derive(Default)]
struct ConnectionIndex(AtomicU64);

impl ConnectionIndex {
    fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Evaluate `source`/`eval` once at startup (spec's supplemented startup
/// keys). These run against a throwaway engine instance: the isolation
/// model gives every connection a fresh, unshared environment, and the
/// `Engine` collaborator interface has no snapshot/export primitive to
/// replicate bindings from one instance into another, so this step is
/// for early error reporting only, not for seeding connection state.
async fn run_startup_eval<E: Engine>(config: &Config, mut scratch: E) {
    if let Some(path) = &config.source {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => eval_each(&mut scratch, &contents, "source"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to read startup source file"),
        }
    }
    if let Some(expr) = &config.eval {
        eval_each(&mut scratch, expr, "eval");
    }
}

fn eval_each<E: Engine>(engine: &mut E, src: &str, origin: &str) {
    let parsed = engine.parse(src, usize::MAX);
    if parsed.status != crate::engine::ParseStatus::Ok {
        warn!(origin, "startup expression failed to parse");
        return;
    }
    for expr in &parsed.exprs {
        if let Err(code) = engine.try_eval(expr) {
            warn!(origin, error_code = code, "startup expression failed to evaluate");
        }
    }
}

/// Run the accept loop until `CMD_shutdown` is received or a termination
/// signal arrives. `engine_factory` builds one fresh engine per accepted
/// connection.
pub async fn run<E, F>(config: Config, engine_factory: F) -> crate::Result<()>
where
    E: Engine + 'static,
    F: Fn() -> E + Send + Sync + 'static,
{
    if !crate::wire::endian_self_test() {
        return Err(crate::RsrvError::EndianSelfTest);
    }

    run_startup_eval(&config, engine_factory()).await;

    #[cfg(unix)]
    drop_privileges(&config)?;

    let config = Arc::new(config);
    let connection_index = Arc::new(ConnectionIndex::default());
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(crate::RsrvError::Io)?;
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .map_err(crate::RsrvError::Io)?;

    if let Some(socket_path) = &config.socket {
        let _ = std::fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path)?;
        info!(path = %socket_path.display(), "listening on unix socket");
        loop {
            tokio::select! {
                biased;
                _ = sigterm.recv() => { info!("received SIGTERM, shutting down"); break; }
                _ = sighup.recv() => { info!("received SIGHUP, shutting down"); break; }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() { break; }
                }
                result = listener.accept() => {
                    let (stream, _addr) = match result {
                        Ok(v) => v,
                        Err(e) => { warn!(error = %e, "accept error"); continue; }
                    };
                    spawn_connection(
                        ClientStream::Unix(stream),
                        SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 0),
                        Arc::clone(&config),
                        &engine_factory,
                        Arc::clone(&connection_index),
                        shutdown_tx.clone(),
                    );
                }
            }
        }
    } else {
        let bind_ip =
            if config.remote { IpAddr::from([0, 0, 0, 0]) } else { IpAddr::from([127, 0, 0, 1]) };
        let listener = bind_tcp_listener(SocketAddr::new(bind_ip, config.port))?;
        info!(addr = %listener.local_addr()?, "listening on tcp");
        loop {
            tokio::select! {
                biased;
                _ = sigterm.recv() => { info!("received SIGTERM, shutting down"); break; }
                _ = sighup.recv() => { info!("received SIGHUP, shutting down"); break; }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() { break; }
                }
                result = listener.accept() => {
                    let (stream, addr) = match result {
                        Ok(v) => v,
                        Err(e) => { warn!(error = %e, "accept error"); continue; }
                    };
                    if !config.remote && !config.allow.contains(&addr.ip()) {
                        warn!(peer = %addr, "connection rejected by IP allowlist");
                        drop(stream);
                        continue;
                    }
                    spawn_connection(
                        ClientStream::Tcp(stream),
                        addr,
                        Arc::clone(&config),
                        &engine_factory,
                        Arc::clone(&connection_index),
                        shutdown_tx.clone(),
                    );
                }
            }
        }
    }

    info!("listener stopped");
    Ok(())
}

fn spawn_connection<E, F>(
    stream: ClientStream,
    peer_addr: SocketAddr,
    config: Arc<Config>,
    engine_factory: &F,
    connection_index: Arc<ConnectionIndex>,
    shutdown_tx: watch::Sender<bool>,
) where
    E: Engine + 'static,
    F: Fn() -> E + Send + Sync + 'static,
{
    let engine = engine_factory();
    let index = connection_index.next();
    tokio::spawn(async move {
        let outcome = session::handle_connection(stream, config, engine, peer_addr, index).await;
        if outcome.shutdown_requested {
            info!("CMD_shutdown received, stopping listener");
            let _ = shutdown_tx.send(true);
        }
    });
}

#[cfg(unix)]
fn drop_privileges(config: &Config) -> crate::Result<()> {
    use nix::unistd::{setgid, setuid, Gid, Uid};

    if let Some(gid) = config.gid {
        setgid(Gid::from_raw(gid))
            .map_err(|e| crate::RsrvError::Config(format!("setgid failed: {e}")))?;
    }
    if let Some(uid) = config.uid {
        setuid(Uid::from_raw(uid))
            .map_err(|e| crate::RsrvError::Config(format!("setuid failed: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ArithEngine;

    #[test]
    fn connection_index_increments_from_zero() {
        let index = ConnectionIndex::default();
        assert_eq!(index.next(), 0);
        assert_eq!(index.next(), 1);
        assert_eq!(index.next(), 2);
    }

    #[tokio::test]
    async fn startup_eval_failure_does_not_panic() {
        let mut config = Config::default();
        config.eval = Some("1 + * 2".to_string());
        run_startup_eval(&config, ArithEngine::new()).await;
    }

    #[tokio::test]
    async fn startup_eval_runs_a_valid_expression() {
        let mut config = Config::default();
        config.eval = Some("1 + 1".to_string());
        run_startup_eval(&config, ArithEngine::new()).await;
    }
}
