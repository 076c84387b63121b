//! Raw HTTP server whose first response stalls mid-body

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub(crate) struct StallingServer {
    pub url: String,
    /// `Range` header of every request, in arrival order
    pub ranges: Arc<Mutex<Vec<Option<String>>>>,
}

impl StallingServer {
    /// The first connection gets `stall_at` bytes and then nothing; later
    /// connections are served from the requested offset
    pub async fn start(name: &str, body: Vec<u8>, stall_at: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ranges = Arc::new(Mutex::new(Vec::new()));
        let body = Arc::new(body);

        let seen = ranges.clone();
        tokio::spawn(async move {
            let mut first = true;
            while let Ok((socket, _)) = listener.accept().await {
                let stall = std::mem::replace(&mut first, false).then_some(stall_at);
                tokio::spawn(serve(socket, body.clone(), seen.clone(), stall));
            }
        });

        Self {
            url: format!("http://{}/files/{}", addr, name),
            ranges,
        }
    }
}

async fn serve(
    mut socket: TcpStream,
    body: Arc<Vec<u8>>,
    seen: Arc<Mutex<Vec<Option<String>>>>,
    stall_at: Option<usize>,
) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }

    let text = String::from_utf8_lossy(&request);
    let range = text.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("range")
            .then(|| value.trim().to_string())
    });
    seen.lock().push(range.clone());

    let start = range
        .as_deref()
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.trim_end_matches('-').parse::<usize>().ok())
        .unwrap_or(0);
    let head = if start > 0 {
        format!(
            "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nConnection: close\r\n\r\n",
            body.len() - start,
            start,
            body.len() - 1,
            body.len()
        )
    } else {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
    };
    if socket.write_all(head.as_bytes()).await.is_err() {
        return;
    }

    match stall_at {
        Some(n) => {
            let _ = socket.write_all(&body[..n]).await;
            let _ = socket.flush().await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        None => {
            let _ = socket.write_all(&body[start..]).await;
        }
    }
    let _ = socket.shutdown().await;
}
