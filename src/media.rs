use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::convert::MatrixMedia;
use crate::error::{BridgeError, BridgeResult};

/// Media repository access with the appservice token.
pub struct MediaHandler {
    client: Client,
    homeserver_url: String,
    access_token: SecretString,
    max_file_size: u64,
}

impl MediaHandler {
    pub fn new(
        homeserver_url: &str,
        access_token: SecretString,
        max_file_size: u64,
        timeout: Duration,
    ) -> BridgeResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(BridgeError::matrix)?;
        Ok(Self {
            client,
            homeserver_url: homeserver_url.trim_end_matches('/').to_string(),
            access_token,
            max_file_size,
        })
    }

    /// Media API URL for an `mxc://server/id` URI.
    pub fn download_url(&self, mxc_url: &str) -> BridgeResult<String> {
        let path = mxc_url
            .strip_prefix("mxc://")
            .filter(|path| path.contains('/'))
            .ok_or_else(|| BridgeError::Conversion(format!("invalid mxc URL: {mxc_url}")))?;
        Ok(format!(
            "{}/_matrix/media/v3/download/{path}",
            self.homeserver_url
        ))
    }

    fn check_size(&self, size: u64) -> BridgeResult<()> {
        if size > self.max_file_size {
            return Err(BridgeError::Conversion(format!(
                "file too large: {size} bytes (max {})",
                self.max_file_size
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MatrixMedia for MediaHandler {
    async fn upload(&self, data: Vec<u8>, filename: &str, mime_type: &str) -> BridgeResult<String> {
        self.check_size(data.len() as u64)?;
        let upload_url = format!(
            "{}/_matrix/media/v3/upload?filename={}",
            self.homeserver_url,
            urlencoding::encode(filename)
        );
        debug!(filename, size = data.len(), "uploading to matrix");

        let response = self
            .client
            .post(&upload_url)
            .bearer_auth(self.access_token.expose_secret())
            .header("Content-Type", mime_type)
            .body(data)
            .send()
            .await
            .map_err(BridgeError::matrix)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::Matrix(format!("upload failed: {status} - {body}")));
        }

        let json: serde_json::Value = response.json().await.map_err(BridgeError::matrix)?;
        let content_uri = json
            .get("content_uri")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BridgeError::Matrix("no content_uri in upload response".to_string()))?
            .to_string();
        debug!(content_uri, "uploaded to matrix");
        Ok(content_uri)
    }

    async fn download(&self, mxc_url: &str) -> BridgeResult<Vec<u8>> {
        let url = self.download_url(mxc_url)?;
        debug!(mxc_url, "downloading matrix media");

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.access_token.expose_secret())
            .send()
            .await
            .map_err(BridgeError::matrix)?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BridgeError::NotFound(format!("media {mxc_url}")));
        }
        if !status.is_success() {
            return Err(BridgeError::Matrix(format!("download of {mxc_url} failed: {status}")));
        }
        if let Some(length) = response.content_length() {
            self.check_size(length)?;
        }
        let data = response.bytes().await.map_err(BridgeError::matrix)?.to_vec();
        self.check_size(data.len() as u64)?;
        Ok(data)
    }
}

mod urlencoding {
    pub fn encode(s: &str) -> String {
        url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use secrecy::SecretString;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::MediaHandler;
    use crate::convert::MatrixMedia;
    use crate::error::BridgeError;

    fn handler(url: &str, max: u64) -> MediaHandler {
        MediaHandler::new(
            url,
            SecretString::from("as-token".to_string()),
            max,
            Duration::from_secs(5),
        )
        .expect("client")
    }

    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn mxc_urls_map_to_the_download_endpoint() {
        let media = handler("https://matrix.example.org/", 10);
        assert_eq!(
            media.download_url("mxc://example.org/abc").expect("valid"),
            "https://matrix.example.org/_matrix/media/v3/download/example.org/abc"
        );
        assert!(media.download_url("https://example.org/abc").is_err());
        assert!(media.download_url("mxc://example.org").is_err());
    }

    #[tokio::test]
    async fn upload_returns_the_content_uri() {
        let url = serve_once("200 OK", r#"{"content_uri":"mxc://example.org/xyz"}"#).await;
        let uri = handler(&url, 1024)
            .upload(b"hello".to_vec(), "hello.txt", "text/plain")
            .await
            .expect("uploaded");
        assert_eq!(uri, "mxc://example.org/xyz");
    }

    #[tokio::test]
    async fn oversized_uploads_are_rejected_before_sending() {
        let media = handler("http://127.0.0.1:1", 4);
        let err = media
            .upload(b"too large".to_vec(), "big.bin", "application/octet-stream")
            .await
            .expect_err("rejected");
        assert!(matches!(err, BridgeError::Conversion(_)));
    }

    #[tokio::test]
    async fn missing_media_is_not_found() {
        let url = serve_once("404 Not Found", r#"{"errcode":"M_NOT_FOUND"}"#).await;
        let err = handler(&url, 1024)
            .download("mxc://example.org/gone")
            .await
            .expect_err("missing");
        assert!(matches!(err, BridgeError::NotFound(_)));
    }
}
