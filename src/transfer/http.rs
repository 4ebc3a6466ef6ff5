//! `MediaServer` over the Immich REST API.
//!
//! Authentication is a static API key in the `x-api-key` header. Live photos
//! are listed as the still image with a `livePhotoVideoId`; the hidden video
//! half is fetched separately and surfaced as its own asset sharing a pair id.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use futures_util::StreamExt;
use reqwest::{multipart, Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use super::error::TransferError;
use super::types::{AlbumRef, AssetKind, AssetRef, DownloadedAsset, UploadRequest};
use super::{part_path, MediaServer};
use crate::metadata::CaptureMetadata;

const DEVICE_ID: &str = "media-migrate";

/// Longest response body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlbumDto {
    id: String,
    album_name: String,
    #[serde(default)]
    asset_count: Option<u64>,
    #[serde(default)]
    assets: Vec<AssetDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetDto {
    id: String,
    #[serde(rename = "type")]
    asset_type: String,
    original_file_name: String,
    #[serde(default)]
    checksum: Option<String>,
    #[serde(default)]
    live_photo_video_id: Option<String>,
    #[serde(default)]
    file_created_at: Option<String>,
    #[serde(default)]
    file_modified_at: Option<String>,
    #[serde(default)]
    exif_info: Option<ExifInfoDto>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExifInfoDto {
    #[serde(default)]
    date_time_original: Option<String>,
    #[serde(default)]
    modify_date: Option<String>,
    #[serde(default)]
    make: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    file_size_in_byte: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CreatedDto {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BulkIdResultDto {
    id: String,
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

fn parse_timestamp(value: Option<&str>) -> Option<DateTime<FixedOffset>> {
    let raw = value?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => Some(dt),
        Err(e) => {
            tracing::debug!("Ignoring unparseable timestamp {:?}: {}", raw, e);
            None
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

impl AssetDto {
    fn kind(&self) -> AssetKind {
        match self.asset_type.as_str() {
            "IMAGE" => AssetKind::Photo,
            "VIDEO" => AssetKind::Video,
            _ => AssetKind::Sidecar,
        }
    }

    fn capture_metadata(&self) -> CaptureMetadata {
        let exif = self.exif_info.as_ref();
        CaptureMetadata {
            date_time_original: parse_timestamp(
                exif.and_then(|e| e.date_time_original.as_deref()),
            ),
            create_date: parse_timestamp(self.file_created_at.as_deref()),
            modify_date: parse_timestamp(
                exif.and_then(|e| e.modify_date.as_deref())
                    .or(self.file_modified_at.as_deref()),
            ),
            make: non_empty(exif.and_then(|e| e.make.clone())),
            model: non_empty(exif.and_then(|e| e.model.clone())),
            description: non_empty(exif.and_then(|e| e.description.clone())),
        }
    }

    fn into_asset_ref(self, pair_id: Option<String>) -> AssetRef {
        AssetRef {
            kind: self.kind(),
            capture_metadata: self.capture_metadata(),
            size_bytes: self
                .exif_info
                .as_ref()
                .and_then(|e| e.file_size_in_byte)
                .unwrap_or(0),
            source_id: self.id,
            pair_id,
            original_filename: self.original_file_name,
            declared_checksum: self.checksum,
        }
    }
}

pub struct HttpMediaServer {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpMediaServer {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, TransferError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransferError::Network {
                operation: "build_client".into(),
                source: e,
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    async fn send(&self, operation: &str, builder: RequestBuilder) -> Result<Response, TransferError> {
        let response = builder
            .header("x-api-key", &self.api_key)
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| TransferError::Network {
                operation: operation.to_string(),
                source: e,
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let mut body = response.text().await.unwrap_or_default();
        body.truncate(char_floor(&body, MAX_ERROR_BODY));
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(TransferError::NotFound(format!("{operation}: {body}")));
        }
        Err(TransferError::HttpStatus {
            status: status.as_u16(),
            operation: operation.to_string(),
            body,
        })
    }

    async fn json<T: DeserializeOwned>(
        &self,
        operation: &str,
        builder: RequestBuilder,
    ) -> Result<T, TransferError> {
        let response = self.send(operation, builder).await?;
        let bytes = response.bytes().await.map_err(|e| TransferError::Network {
            operation: operation.to_string(),
            source: e,
        })?;
        serde_json::from_slice(&bytes).map_err(|e| TransferError::Protocol {
            operation: operation.to_string(),
            message: e.to_string(),
        })
    }

    async fn asset_info(&self, asset_id: &str) -> Result<AssetDto, TransferError> {
        let url = self.url(&format!("/assets/{asset_id}"));
        self.json("get_asset", self.client.get(url)).await
    }
}

#[async_trait::async_trait]
impl MediaServer for HttpMediaServer {
    async fn list_albums(&self) -> Result<Vec<AlbumRef>, TransferError> {
        let albums: Vec<AlbumDto> = self
            .json("list_albums", self.client.get(self.url("/albums")))
            .await?;
        Ok(albums
            .into_iter()
            .map(|a| AlbumRef {
                id: a.id,
                name: a.album_name,
                asset_count: a.asset_count,
            })
            .collect())
    }

    async fn list_assets(&self, album_id: &str) -> Result<Vec<AssetRef>, TransferError> {
        let url = self.url(&format!("/albums/{album_id}"));
        let album: AlbumDto = self.json("list_assets", self.client.get(url)).await?;

        let mut assets = Vec::with_capacity(album.assets.len());
        for dto in album.assets {
            let Some(video_id) = dto.live_photo_video_id.clone() else {
                assets.push(dto.into_asset_ref(None));
                continue;
            };
            let pair_id = dto.id.clone();
            match self.asset_info(&video_id).await {
                Ok(video) => {
                    assets.push(dto.into_asset_ref(Some(pair_id.clone())));
                    assets.push(video.into_asset_ref(Some(pair_id)));
                }
                Err(TransferError::NotFound(_)) => {
                    tracing::warn!(
                        source_id = %pair_id,
                        video_id = %video_id,
                        "Live-photo video missing on source, migrating the still only"
                    );
                    assets.push(dto.into_asset_ref(None));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(assets)
    }

    async fn download(
        &self,
        asset_id: &str,
        dest: &Path,
    ) -> Result<DownloadedAsset, TransferError> {
        let info = self.asset_info(asset_id).await?;
        let url = self.url(&format!("/assets/{asset_id}/original"));
        let response = self.send("download", self.client.get(url)).await?;

        let part = part_path(dest);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&part)
            .await?;

        let mut bytes_written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    let _ = fs::remove_file(&part).await;
                    return Err(TransferError::Network {
                        operation: "download".into(),
                        source: e,
                    });
                }
            };
            file.write_all(&chunk).await?;
            bytes_written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&part, dest).await?;

        Ok(DownloadedAsset {
            capture_metadata: info.capture_metadata(),
            declared_checksum: info.checksum,
            bytes_written,
        })
    }

    async fn upload(
        &self,
        local_path: &Path,
        request: &UploadRequest,
    ) -> Result<String, TransferError> {
        let file = fs::File::open(local_path).await?;
        let len = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let part = multipart::Part::stream_with_length(body, len)
            .file_name(request.filename.clone());

        let now = DateTime::<FixedOffset>::from(chrono::Utc::now());
        let created = request
            .capture_metadata
            .date_time_original
            .or(request.capture_metadata.create_date)
            .unwrap_or(now);
        let modified = request.capture_metadata.modify_date.unwrap_or(created);

        let mut form = multipart::Form::new()
            .part("assetData", part)
            .text("deviceAssetId", request.source_id.clone())
            .text("deviceId", DEVICE_ID)
            .text("fileCreatedAt", created.to_rfc3339())
            .text("fileModifiedAt", modified.to_rfc3339());
        if let Some(video_id) = &request.live_photo_video_id {
            form = form.text("livePhotoVideoId", video_id.clone());
        }

        let uploaded: CreatedDto = self
            .json(
                "upload",
                self.client.post(self.url("/assets")).multipart(form),
            )
            .await?;
        if uploaded.status.as_deref() == Some("duplicate") {
            tracing::info!(
                source_id = %request.source_id,
                destination_id = %uploaded.id,
                "Destination already holds identical content, reusing it"
            );
        }
        Ok(uploaded.id)
    }

    async fn create_album(&self, name: &str) -> Result<String, TransferError> {
        let created: CreatedDto = self
            .json(
                "create_album",
                self.client
                    .post(self.url("/albums"))
                    .json(&json!({ "albumName": name })),
            )
            .await?;
        Ok(created.id)
    }

    async fn add_to_album(
        &self,
        album_id: &str,
        destination_ids: &[String],
    ) -> Result<(), TransferError> {
        if destination_ids.is_empty() {
            return Ok(());
        }
        let url = self.url(&format!("/albums/{album_id}/assets"));
        let results: Vec<BulkIdResultDto> = self
            .json(
                "add_to_album",
                self.client.put(url).json(&json!({ "ids": destination_ids })),
            )
            .await?;
        for result in results.iter().filter(|r| !r.success) {
            // Already a member is the outcome we wanted.
            if result.error.as_deref() == Some("duplicate") {
                continue;
            }
            return Err(TransferError::Protocol {
                operation: "add_to_album".into(),
                message: format!(
                    "asset {} rejected: {}",
                    result.id,
                    result.error.as_deref().unwrap_or("unknown error")
                ),
            });
        }
        Ok(())
    }
}

/// Largest char boundary in `s` at or below `max`.
fn char_floor(s: &str, max: usize) -> usize {
    (0..=max.min(s.len()))
        .rev()
        .find(|&i| s.is_char_boundary(i))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response on a loopback port.
    async fn serve_once(status_line: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: text/plain; charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}")
    }

    fn asset_json() -> serde_json::Value {
        json!({
            "id": "a-1",
            "type": "IMAGE",
            "originalFileName": "IMG_0001.HEIC",
            "checksum": "qUqP5cyxm6YcTAhz05Hph5gvu9M=",
            "livePhotoVideoId": "v-1",
            "fileCreatedAt": "2019-07-14T07:30:05.000Z",
            "fileModifiedAt": "2019-07-15T08:00:00.000Z",
            "exifInfo": {
                "dateTimeOriginal": "2019-07-14T07:30:05+02:00",
                "make": "Apple",
                "model": "iPhone 8",
                "description": "",
                "fileSizeInByte": 1234
            }
        })
    }

    #[test]
    fn test_asset_dto_mapping() {
        let dto: AssetDto = serde_json::from_value(asset_json()).unwrap();
        let asset = dto.into_asset_ref(Some("a-1".into()));
        assert_eq!(asset.source_id, "a-1");
        assert_eq!(asset.kind, AssetKind::Photo);
        assert_eq!(asset.pair_id.as_deref(), Some("a-1"));
        assert_eq!(asset.size_bytes, 1234);
        let meta = &asset.capture_metadata;
        assert_eq!(
            meta.date_time_original.unwrap().to_rfc3339(),
            "2019-07-14T07:30:05+02:00"
        );
        assert_eq!(meta.make.as_deref(), Some("Apple"));
        // Blank strings are not metadata.
        assert_eq!(meta.description, None);
        assert!(meta.modify_date.is_some());
    }

    #[test]
    fn test_asset_dto_minimal_fields() {
        let dto: AssetDto = serde_json::from_value(json!({
            "id": "v-1",
            "type": "VIDEO",
            "originalFileName": "IMG_0001.MOV"
        }))
        .unwrap();
        let asset = dto.into_asset_ref(None);
        assert_eq!(asset.kind, AssetKind::Video);
        assert!(asset.capture_metadata.is_empty());
        assert_eq!(asset.declared_checksum, None);
    }

    #[test]
    fn test_unknown_asset_type_is_sidecar() {
        let dto: AssetDto = serde_json::from_value(json!({
            "id": "x",
            "type": "OTHER",
            "originalFileName": "IMG_0001.xmp"
        }))
        .unwrap();
        assert_eq!(dto.kind(), AssetKind::Sidecar);
    }

    #[test]
    fn test_url_joins_without_double_slash() {
        let server =
            HttpMediaServer::new("http://photos.local:2283/", "key", Duration::from_secs(5))
                .unwrap();
        assert_eq!(server.url("/albums"), "http://photos.local:2283/api/albums");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let server =
            HttpMediaServer::new("http://127.0.0.1:1", "key", Duration::from_secs(5)).unwrap();
        let err = server.list_albums().await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err}");
    }

    #[test]
    fn test_char_floor_steps_back_to_boundary() {
        let s = format!("{}é", "a".repeat(511));
        assert_eq!(s.len(), 513);
        assert_eq!(char_floor(&s, 512), 511);
        assert_eq!(char_floor(&s, 513), 513);
        assert_eq!(char_floor("short", 512), 5);
    }

    #[tokio::test]
    async fn test_error_body_cut_at_char_boundary() {
        let body = format!("{}é", "a".repeat(511));
        let base = serve_once("400 Bad Request", body).await;
        let server = HttpMediaServer::new(&base, "key", Duration::from_secs(5)).unwrap();
        match server.list_albums().await {
            Err(TransferError::HttpStatus { status, body, .. }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "a".repeat(511));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
