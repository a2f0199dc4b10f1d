//! Fetching remote artifacts: transports, the resumable single-file downloader and
//! the batch downloaders built on it.

mod batch;
mod resumable;
mod transport;

pub use batch::{
    default_workers, downloader_for, fetch_document, DownloadEntry, Downloader, OnEach,
    ParallelDownloader, SequentialDownloader,
};
pub use resumable::{Outcome, ProgressFn, ResumableDownloader, RetryPolicy, BLOCK_SIZE};
pub use transport::{transport_for, ByteReader, FileTransport, HttpTransport, Opened, Transport};

/// Minimal HTTP/1.1 file server for exercising the HTTP transport: answers `HEAD`
/// and `GET`, honors `Range: bytes=N-` when asked to, and returns 404 for `/missing`.
#[cfg(test)]
pub(crate) mod test_server {
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    pub(crate) struct TestServer {
        addr: SocketAddr,
        pub(crate) ranges: Arc<Mutex<Vec<u64>>>,
    }

    impl TestServer {
        pub(crate) async fn start(body: Vec<u8>, supports_ranges: bool) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let ranges = Arc::new(Mutex::new(Vec::new()));
            let body = Arc::new(body);

            let seen = ranges.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let body = body.clone();
                    let seen = seen.clone();
                    tokio::spawn(async move {
                        let _ = serve(stream, &body, supports_ranges, &seen).await;
                    });
                }
            });

            Self { addr, ranges }
        }

        pub(crate) fn url(&self, path: &str) -> String {
            format!("http://{}/{}", self.addr, path)
        }
    }

    async fn serve(
        mut stream: TcpStream,
        body: &[u8],
        supports_ranges: bool,
        seen: &Mutex<Vec<u64>>,
    ) -> std::io::Result<()> {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if stream.read(&mut byte).await? == 0 {
                return Ok(());
            }
            head.push(byte[0]);
        }
        let head = String::from_utf8_lossy(&head).to_string();
        let mut lines = head.lines();
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let path = parts.next().unwrap_or_default().to_string();

        let range = lines
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("range"))
            .and_then(|(_, value)| {
                value
                    .trim()
                    .strip_prefix("bytes=")?
                    .trim_end_matches('-')
                    .parse::<u64>()
                    .ok()
            });

        if path == "/missing" {
            stream
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await?;
            return stream.shutdown().await;
        }

        let total = body.len() as u64;
        let (status, start) = match range {
            Some(offset) if supports_ranges && offset < total => {
                seen.lock().unwrap().push(offset);
                ("206 Partial Content", offset)
            }
            _ => ("200 OK", 0),
        };
        let payload = &body[start as usize..];

        let mut response = format!(
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n",
            payload.len()
        );
        if start > 0 {
            response.push_str(&format!(
                "Content-Range: bytes {start}-{}/{total}\r\n",
                total - 1
            ));
        }
        response.push_str("\r\n");
        stream.write_all(response.as_bytes()).await?;
        if method != "HEAD" {
            stream.write_all(payload).await?;
        }
        stream.shutdown().await
    }
}
