//! Shared fixtures: an in-process bincode server speaking the client's framing

#![allow(dead_code)]

use bytes::Bytes;
use rpc::{BincodeProtocol, Instance, Response};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Initialize tracing for tests (call once per test)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Server behavior is chosen by the request method:
///
/// - `ping`: echo the payload
/// - `slow`: echo after `delay`
/// - `fail`: service error 500
/// - `silent`: never answer
pub struct TestServer {
    pub instance: Instance,
    pub connections: Arc<AtomicUsize>,
    pub requests: Arc<AtomicUsize>,
    accept: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::with_delay(Duration::from_millis(100)).await
    }

    pub async fn with_delay(delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(AtomicUsize::new(0));

        let accept = {
            let connections = Arc::clone(&connections);
            let requests = Arc::clone(&requests);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(stream, delay, Arc::clone(&requests)));
                }
            })
        };

        Self {
            instance: Instance::new("127.0.0.1", port),
            connections,
            requests,
            accept,
        }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn serve(stream: TcpStream, delay: Duration, requests: Arc<AtomicUsize>) {
    let protocol = BincodeProtocol::new();
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));

    loop {
        let mut len = [0u8; 4];
        if reader.read_exact(&mut len).await.is_err() {
            return;
        }
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        if reader.read_exact(&mut body).await.is_err() {
            return;
        }
        let Ok(request) = protocol.decode_request(&body) else {
            return;
        };
        requests.fetch_add(1, Ordering::SeqCst);

        let writer = Arc::clone(&writer);
        tokio::spawn(async move {
            let id = request.correlation_id;
            let response = match request.method.as_str() {
                "ping" => Response::ok(id, request.payload),
                "slow" => {
                    tokio::time::sleep(delay).await;
                    Response::ok(id, request.payload)
                }
                "fail" => Response::service_error(id, 500, "boom"),
                "silent" => return,
                other => Response::service_error(id, 404, format!("unknown method {}", other)),
            };
            reply(&writer, &response).await;
        });
    }
}

async fn reply(writer: &Mutex<OwnedWriteHalf>, response: &Response) {
    let Ok(frame) = BincodeProtocol::new().encode_response(response) else {
        return;
    };
    let mut writer = writer.lock().await;
    let _ = writer.write_all(&(frame.len() as u32).to_be_bytes()).await;
    let _ = writer.write_all(&frame).await;
}

/// An address nothing listens on
pub async fn dead_instance() -> Instance {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Instance::new("127.0.0.1", port)
}

pub fn payload(text: &'static str) -> Bytes {
    Bytes::from_static(text.as_bytes())
}
