//! TCP channel against a loopback fake controller.

use spm_core::{FailureClass, TransportError};
use spm_protocol::{
    ChannelConfig, ControllerStatus, ProtocolClient, ResolvedCommand, TcpChannel,
    TemplateRegistry, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

fn config() -> ChannelConfig {
    ChannelConfig {
        reply_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_secs(1),
        terminator: "\r\n".to_string(),
    }
}

/// Answer each line: `STATUS?` → `IDLE`, `BIAS x` → `x`, anything else echoed.
/// Returns after `limit` lines, dropping the connection.
async fn serve(stream: TcpStream, limit: usize) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut served = 0;
    while served < limit {
        let Ok(Some(line)) = lines.next_line().await else {
            return;
        };
        let reply = if line == "STATUS?" {
            "IDLE".to_string()
        } else if let Some(value) = line.strip_prefix("BIAS ") {
            value.to_string()
        } else {
            line.clone()
        };
        if write.write_all(format!("{}\n", reply).as_bytes()).await.is_err() {
            return;
        }
        served += 1;
    }
}

#[tokio::test]
async fn client_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        serve(stream, usize::MAX).await;
    });

    let templates = Arc::new(
        TemplateRegistry::from_json_str(
            r#"{"set_bias": "BIAS ${bias:.2f}", "start_scan": "SCAN START", "poll_status": "STATUS?"}"#,
        )
        .unwrap(),
    );
    let channel = TcpChannel::connect(&address, config()).await.unwrap();
    let client = ProtocolClient::new(templates, channel);

    assert_eq!(client.set_bias(-0.5).await.unwrap(), -0.5);
    client.start_scan().await.unwrap();
    assert_eq!(client.poll_status().await.unwrap(), ControllerStatus::Idle);

    client.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn reconnect_after_controller_hangs_up() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let server = tokio::spawn(async move {
        // First connection answers once and hangs up; the second stays up.
        let (first, _) = listener.accept().await.unwrap();
        serve(first, 1).await;
        let (second, _) = listener.accept().await.unwrap();
        serve(second, usize::MAX).await;
    });

    let mut channel = TcpChannel::connect(&address, config()).await.unwrap();
    let status = ResolvedCommand::raw("STATUS?");

    assert_eq!(channel.send(&status).await.unwrap(), "IDLE");
    let err = channel.send(&status).await.unwrap_err();
    assert_eq!(err.class(), FailureClass::Fatal);

    channel.reconnect().await.unwrap();
    assert!(!channel.is_closed());
    assert_eq!(channel.send(&status).await.unwrap(), "IDLE");

    channel.close().await;
    channel.close().await;
    assert!(matches!(
        channel.send(&status).await,
        Err(TransportError::Closed)
    ));
    server.await.unwrap();
}

#[tokio::test]
async fn silent_controller_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let _server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        // Read but never answer.
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(_)) = lines.next_line().await {}
    });

    let channel = TcpChannel::connect(
        &address,
        ChannelConfig {
            reply_timeout: Duration::from_millis(50),
            ..config()
        },
    )
    .await
    .unwrap();

    let err = channel
        .send(&ResolvedCommand::raw("STATUS?"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Timeout(_)));
    assert_eq!(err.class(), FailureClass::Transient);
}

#[tokio::test]
async fn connect_to_closed_port_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let err = TcpChannel::connect(&address, config()).await.err().unwrap();
    assert!(matches!(err, TransportError::Connection { .. }));
}
