//! Test fixtures: a minimal HTTP/1.1 responder for exercising the clients
//! without network access, and a client wired to it. Every response is
//! served on its own connection.

use crate::{
    crypto::{CryptoError, FusCrypto},
    fus::{Endpoints, FusClient, FusClientBuilder},
    msg::FusMessageBuilder,
};

use std::{collections::HashMap, sync::Arc};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    task::JoinHandle,
};

pub struct MockResponse {
    pub status: u16,
    pub nonce: Option<&'static str>,
    pub body: Vec<u8>,
}

impl MockResponse {
    pub fn ok(nonce: Option<&'static str>, body: impl Into<Vec<u8>>) -> Self {
        Self { status: 200, nonce, body: body.into() }
    }

    pub fn status(status: u16) -> Self {
        Self { status, nonce: None, body: vec![] }
    }
}

#[derive(Debug)]
pub struct RecordedRequest {
    pub line: String,
    pub headers: HashMap<String, String>,
}

/// Serve the given responses in order and return the base URL along with a
/// handle resolving to the requests that were received.
pub async fn serve(responses: Vec<MockResponse>) -> (String, JoinHandle<Vec<RecordedRequest>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let mut requests = vec![];

        for response in responses {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![];
            let mut chunk = [0u8; 4096];

            let header_end = loop {
                let n = stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "Client closed connection early");
                buf.extend_from_slice(&chunk[..n]);
                if let Some(i) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break i + 4;
                }
            };

            let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
            let mut lines = head.split("\r\n");
            let line = lines.next().unwrap().to_owned();
            let headers: HashMap<String, String> = lines
                .filter_map(|l| l.split_once(": "))
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_owned()))
                .collect();

            let body_len: usize = headers.get("content-length")
                .map(|v| v.parse().unwrap())
                .unwrap_or(0);
            while buf.len() < header_end + body_len {
                let n = stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "Client closed connection early");
                buf.extend_from_slice(&chunk[..n]);
            }

            let mut head = format!(
                "HTTP/1.1 {} Mock\r\nContent-Length: {}\r\nConnection: close\r\n",
                response.status,
                response.body.len(),
            );
            if let Some(n) = response.nonce {
                head.push_str(&format!("NONCE: {n}\r\n"));
            }
            head.push_str("\r\n");

            stream.write_all(head.as_bytes()).await.unwrap();
            // The client may hang up early when it rejects the response
            let _ = stream.write_all(&response.body).await;
            let _ = stream.shutdown().await;

            requests.push(RecordedRequest { line, headers });
        }

        requests
    });

    (format!("http://{addr}"), handle)
}

/// Reversible stand-in for the vendor crypto.
pub struct TestCrypto;

impl FusCrypto for TestCrypto {
    fn decrypt_nonce(&self, nonce: &str) -> Result<String, CryptoError> {
        Ok(format!("dec-{nonce}"))
    }

    fn signature(&self, decrypted_nonce: &str) -> String {
        format!("sig-{decrypted_nonce}")
    }
}

/// Client with every endpoint pointed at `base`.
pub fn client_for(base: &str) -> FusClient {
    let crypto: Arc<dyn FusCrypto> = Arc::new(TestCrypto);
    let messages = Arc::new(FusMessageBuilder::new(crypto.clone()));

    FusClientBuilder::new(crypto, messages)
        .endpoints(Endpoints {
            fus: base.to_owned(),
            download: base.to_owned(),
        })
        .build()
        .unwrap()
}

pub fn status_body() -> String {
    "<FUSMsg><FUSBody><Results><Status>200</Status></Results></FUSBody></FUSMsg>".to_owned()
}
