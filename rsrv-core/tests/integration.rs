//! End-to-end tests driving a real `rsrv_core::listener::run` instance
//! over a loopback `TcpStream`, covering the connection-lifecycle
//! scenarios (spec §8 S1-S6).

use rsrv_core::engine::ArithEngine;
use rsrv_core::wire::*;
use rsrv_core::Config;
use serial_test::serial;
use std::time::Duration;
use tokio::net::TcpStream;

async fn start_server(mut config: Config) -> (u16, tokio::task::JoinHandle<()>) {
    let probe = rsrv_core::net::bind_tcp_listener(std::net::SocketAddr::new(
        std::net::IpAddr::from([127, 0, 0, 1]),
        0,
    ))
    .unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    config.port = port;
    let handle = tokio::spawn(async move {
        let _ = rsrv_core::listener::run(config, ArithEngine::new).await;
    });
    // Give the listener a moment to bind before the test client connects.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, handle)
}

async fn connect(port: u16) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut greeting = [0u8; 32];
    tokio::io::AsyncReadExt::read_exact(&mut stream, &mut greeting).await.unwrap();
    assert_eq!(&greeting[0..12], b"Rsrv0102QAP1");
    stream
}

fn eval_request(src: &str) -> Vec<u8> {
    encode_frame(CMD_EVAL, &encode_params(&[Param::Str(src.to_string())]))
}

#[tokio::test]
#[serial]
async fn s1_connect_and_receive_greeting() {
    let (port, _handle) = start_server(Config::default()).await;
    let _stream = connect(port).await;
}

#[tokio::test]
#[serial]
async fn s2_eval_arithmetic_returns_a_value() {
    let (port, _handle) = start_server(Config::default()).await;
    let mut stream = connect(port).await;

    write_frame(&mut stream, &eval_request("1 + 2")).await.unwrap();
    let (cmd, payload) = read_frame(&mut stream).await.unwrap().unwrap();
    assert_eq!(cmd, RESP_OK);
    let params = iter_params(&payload, false).unwrap();
    assert_eq!(params.len(), 1);
    assert_eq!(params[0].type_byte, DT_SEXP);
    let sexp = decode_sexp_param(params[0].body(&payload)).unwrap();
    assert_eq!(sexp.value, Value::ArrayDouble(vec![3.0]));
}

#[tokio::test]
#[serial]
async fn s3_unknown_command_before_auth_is_rejected() {
    let mut config = Config::default();
    config.auth = true;
    config.plaintext = true;
    let (port, _handle) = start_server(config).await;
    let mut stream = connect(port).await;

    write_frame(&mut stream, &eval_request("1 + 1")).await.unwrap();
    let (cmd, payload) = read_frame(&mut stream).await.unwrap().unwrap();
    assert_eq!(cmd, RESP_ERR);
    assert_eq!(payload.len(), 0);
}

#[tokio::test]
#[serial]
async fn s4_login_then_eval_succeeds_when_auth_required() {
    let mut config = Config::default();
    config.auth = true;
    config.plaintext = true;
    config.pwdfile = None;
    let (port, _handle) = start_server(config).await;
    let mut stream = connect(port).await;

    let login = encode_frame(CMD_LOGIN, &encode_params(&[Param::Str("alice\nwhatever".into())]));
    write_frame(&mut stream, &login).await.unwrap();
    let (cmd, _payload) = read_frame(&mut stream).await.unwrap().unwrap();
    assert_eq!(cmd, RESP_OK);

    write_frame(&mut stream, &eval_request("2 * 3")).await.unwrap();
    let (cmd, payload) = read_frame(&mut stream).await.unwrap().unwrap();
    assert_eq!(cmd, RESP_OK);
    let params = iter_params(&payload, false).unwrap();
    let sexp = decode_sexp_param(params[0].body(&payload)).unwrap();
    assert_eq!(sexp.value, Value::ArrayDouble(vec![6.0]));
}

#[tokio::test]
#[serial]
async fn s5_invalid_expression_reports_inv_par() {
    let (port, _handle) = start_server(Config::default()).await;
    let mut stream = connect(port).await;

    write_frame(&mut stream, &eval_request("1 + * 2")).await.unwrap();
    let (cmd, _payload) = read_frame(&mut stream).await.unwrap().unwrap();
    assert_eq!(cmd, RESP_ERR);
}

#[tokio::test]
#[serial]
async fn s6_shutdown_command_tears_down_the_listener() {
    let (port, handle) = start_server(Config::default()).await;
    let mut stream = connect(port).await;

    let shutdown = encode_frame(CMD_SHUTDOWN, &[]);
    write_frame(&mut stream, &shutdown).await.unwrap();
    let (cmd, _payload) = read_frame(&mut stream).await.unwrap().unwrap();
    assert_eq!(cmd, RESP_OK);

    tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}
