//! Byte sources the downloader reads from.

use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Client, StatusCode};
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncSeekExt};
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::config::NetworkSettings;
use crate::error::{PatchError, Result};

pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// An open stream and the offset it actually starts at. A source that cannot seek
/// answers with offset 0 whatever was asked.
pub struct Opened {
    pub offset: u64,
    pub reader: ByteReader,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Size of the remote file, when the source can tell without sending it.
    async fn remote_size(&self, url: &str) -> Result<Option<u64>>;

    async fn open(&self, url: &str, offset: u64) -> Result<Opened>;

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>>;
}

/// Pick the transport for a remote root: `http(s)://` goes over the network,
/// anything else is read from the local file system.
pub fn transport_for(remote_url: &str, network: &NetworkSettings) -> Result<Box<dyn Transport>> {
    let lower = remote_url.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        Ok(Box::new(HttpTransport::new(network)?))
    } else {
        Ok(Box::new(FileTransport))
    }
}

pub struct HttpTransport {
    client: Client,
    credentials: Option<(String, Option<String>)>,
}

impl HttpTransport {
    pub fn new(network: &NetworkSettings) -> Result<Self> {
        let mut builder = Client::builder()
            .user_agent(concat!("smartpatch/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(network.accept_invalid_certs);

        builder = match &network.proxy {
            Some(proxy_url) => {
                let mut proxy = reqwest::Proxy::all(proxy_url).map_err(|e| {
                    PatchError::configuration(format!("invalid proxy {proxy_url}: {e}"))
                })?;
                if let Some(user) = &network.username {
                    proxy = proxy.basic_auth(user, network.password.as_deref().unwrap_or(""));
                }
                builder.proxy(proxy)
            }
            None => builder.no_proxy(),
        };

        if let Some(pem_path) = &network.root_certificate {
            let pem = std::fs::read(pem_path).map_err(|e| PatchError::io(pem_path, e))?;
            let certificate = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                PatchError::configuration(format!(
                    "invalid root certificate {}: {e}",
                    pem_path.display()
                ))
            })?;
            builder = builder.add_root_certificate(certificate);
        }

        let client = builder
            .build()
            .map_err(|e| PatchError::configuration(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            credentials: network
                .username
                .clone()
                .map(|user| (user, network.password.clone())),
        })
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.request(method, url);
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, password.as_ref()),
            None => request,
        }
    }
}

fn check_status(url: &str, status: StatusCode) -> Result<()> {
    match status {
        StatusCode::NOT_FOUND => Err(PatchError::Missing {
            url: url.to_string(),
        }),
        s if s.is_success() => Ok(()),
        s => Err(PatchError::transport(url, format!("HTTP {s}"))),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn remote_size(&self, url: &str) -> Result<Option<u64>> {
        let response = self
            .request(reqwest::Method::HEAD, url)
            .send()
            .await
            .map_err(|e| PatchError::transport(url, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(PatchError::Missing { url: url.to_string() });
        }
        if !response.status().is_success() {
            return Ok(None);
        }

        // `Response::content_length` reports the body length, which is zero for HEAD.
        Ok(response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok()))
    }

    async fn open(&self, url: &str, offset: u64) -> Result<Opened> {
        let mut request = self.request(reqwest::Method::GET, url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = request
            .send()
            .await
            .map_err(|e| PatchError::transport(url, e))?;

        let status = response.status();
        check_status(url, status)?;
        let offset = if status == StatusCode::PARTIAL_CONTENT {
            offset
        } else {
            0
        };

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Opened {
            offset,
            reader: Box::new(StreamReader::new(Box::pin(stream))),
        })
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(|e| PatchError::transport(url, e))?;
        check_status(url, response.status())?;
        let body = response
            .bytes()
            .await
            .map_err(|e| PatchError::transport(url, e))?;
        Ok(body.to_vec())
    }
}

/// Reads `file://` URLs and plain paths. Seeking is always honored.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileTransport;

impl FileTransport {
    pub fn local_path(url: &str) -> PathBuf {
        let path = url.strip_prefix("file://").unwrap_or(url);
        // file:///C:/dir
        #[cfg(windows)]
        let path = match path.as_bytes() {
            [b'/', _, b':', ..] => &path[1..],
            _ => path,
        };
        PathBuf::from(path)
    }
}

fn source_error(url: &str, e: std::io::Error) -> PatchError {
    if e.kind() == std::io::ErrorKind::NotFound {
        return PatchError::Missing {
            url: url.to_string(),
        };
    }
    PatchError::transport(url, e)
}

#[async_trait]
impl Transport for FileTransport {
    async fn remote_size(&self, url: &str) -> Result<Option<u64>> {
        let meta = tokio::fs::metadata(Self::local_path(url))
            .await
            .map_err(|e| source_error(url, e))?;
        Ok(Some(meta.len()))
    }

    async fn open(&self, url: &str, offset: u64) -> Result<Opened> {
        let mut file = tokio::fs::File::open(Self::local_path(url))
            .await
            .map_err(|e| source_error(url, e))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| source_error(url, e))?;
        }
        debug!(url, offset, "Opened local source");
        Ok(Opened {
            offset,
            reader: Box::new(file),
        })
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        tokio::fs::read(Self::local_path(url))
            .await
            .map_err(|e| source_error(url, e))
    }
}
