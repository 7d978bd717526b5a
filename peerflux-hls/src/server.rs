use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, RETRY_AFTER};
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{debug, error, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::job::JobKey;
use crate::manager::{RemuxKey, SeekMode, StreamJobManager};
use crate::playlist::{rewrite_segment_urls, safe_segment_path};
use crate::Error;

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";
const MP4_CONTENT_TYPE: &str = "video/mp4";
const PLAYLIST_EXTENSION: &str = "m3u8";

const HEADER_DLNA_TRANSFER_MODE: &str = "transferMode.dlna.org";
const HEADER_DLNA_REAL_TIME_INFO: &str = "realTimeInfo.dlna.org";
const HEADER_DLNA_CONTENT_FEATURES: &str = "contentFeatures.dlna.org";
const DLNA_TRANSFER_MODE_TYPE: &str = "Streaming";
const DLNA_REAL_TIME_TYPE: &str = "DLNA.ORG_TLAG=*";
const DLNA_CONTENT_FEATURES: &str =
    "DLNA.ORG_OP=01;DLNA.ORG_CI=0;DLNA.ORG_FLAGS=01100000000000000000000000000000";

/// The number of seconds a client should wait before retrying a pending remux.
const REMUX_RETRY_AFTER_SECS: &str = "3";

const DIRECT_PLAY_EXTENSIONS: [&str; 2] = ["mp4", "m4v"];
const REMUX_EXTENSION: &str = "mkv";

/// The track selection carried on playlist and segment requests.
#[derive(Debug, Clone, Deserialize)]
struct TrackQuery {
    #[serde(rename = "audioTrack", default)]
    audio_track: i32,
    #[serde(rename = "subtitleTrack", default = "default_subtitle_track")]
    subtitle_track: i32,
}

fn default_subtitle_track() -> i32 {
    -1
}

#[derive(Debug, Clone, Deserialize)]
struct SeekQuery {
    time: Option<String>,
    #[serde(rename = "audioTrack", default)]
    audio_track: i32,
    #[serde(rename = "subtitleTrack", default = "default_subtitle_track")]
    subtitle_track: i32,
}

#[derive(Debug, Clone, Serialize)]
struct SeekResponse {
    #[serde(rename = "seekTime")]
    seek_time: f64,
    #[serde(rename = "seekMode")]
    seek_mode: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// The http server exposing the streaming subsystem.
#[derive(Debug, Clone)]
pub struct StreamApiServer {
    inner: Arc<InnerStreamApiServer>,
}

impl StreamApiServer {
    /// Create a new server on a random port.
    /// The port will be assigned by the OS.
    pub async fn new(manager: Option<StreamJobManager>) -> std::io::Result<Self> {
        Self::with_port(manager, 0).await
    }

    /// Try to create a new server instance on the specified port.
    pub async fn with_port(manager: Option<StreamJobManager>, port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        let addr = listener.local_addr()?;
        let cancellation_token = CancellationToken::new();
        let inner = Arc::new(InnerStreamApiServer {
            addr,
            cancellation_token: cancellation_token.clone(),
        });

        let router = Self::router(manager);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(cancellation_token.cancelled_owned())
                .await
            {
                error!("Failed to serve the stream api, {}", e);
            }
        });

        Ok(Self { inner })
    }

    /// The address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Build the router of the streaming subsystem, mountable within a host application.
    pub fn router(manager: Option<StreamJobManager>) -> Router {
        let state = ApiState { manager };

        Router::new()
            .route(
                "/torrents/{torrent_id}/hls/{file_index}/index.m3u8",
                get(Self::get_playlist),
            )
            .route(
                "/torrents/{torrent_id}/hls/{file_index}/seek",
                post(Self::post_seek),
            )
            .route(
                "/torrents/{torrent_id}/hls/{file_index}/{*segment}",
                get(Self::get_segment),
            )
            .route(
                "/torrents/{torrent_id}/direct/{file_index}",
                get(Self::get_direct),
            )
            .route("/health", get(Self::get_health))
            .with_state(state)
    }

    async fn get_playlist(
        State(state): State<ApiState>,
        UrlPath((torrent_id, file_index)): UrlPath<(String, String)>,
        Query(tracks): Query<TrackQuery>,
    ) -> Response<Body> {
        let manager = match state.manager.as_ref() {
            Some(e) => e,
            None => return not_configured_response(),
        };
        let file_index = match parse_file_index(file_index.as_str()) {
            Ok(e) => e,
            Err(response) => return response,
        };

        let key = JobKey {
            torrent_id,
            file_index,
            audio_track: tracks.audio_track,
            subtitle_track: tracks.subtitle_track,
        };
        trace!("Handling playlist request for {}", key);
        let job = match manager.ensure_job(key).await {
            Ok(e) => e,
            Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
        };

        if let Err(e) = job.wait_ready().await {
            warn!("Stream job failed to become ready, {}", e);
            let status = match e {
                Error::SubtitleSourceUnavailable(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            return error_response(status, &e);
        }

        match job
            .rewritten_playlist(tracks.audio_track, tracks.subtitle_track)
            .await
        {
            Ok(content) => Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, PLAYLIST_CONTENT_TYPE)
                .body(Body::from(content))
                .unwrap_or_else(handle_internal_error),
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
        }
    }

    async fn get_segment(
        State(state): State<ApiState>,
        UrlPath((torrent_id, file_index, segment)): UrlPath<(String, String, String)>,
        Query(tracks): Query<TrackQuery>,
    ) -> Response<Body> {
        let manager = match state.manager.as_ref() {
            Some(e) => e,
            None => return not_configured_response(),
        };
        let file_index = match parse_file_index(file_index.as_str()) {
            Ok(e) => e,
            Err(response) => return response,
        };
        let segment = match percent_encoding::percent_decode_str(segment.as_str()).decode_utf8() {
            Ok(e) => e.to_string(),
            Err(_) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &Error::InvalidRequest("invalid segment name".to_string()),
                )
            }
        };

        let key = JobKey {
            torrent_id,
            file_index,
            audio_track: tracks.audio_track,
            subtitle_track: tracks.subtitle_track,
        };
        let job = match manager.get_job(&key).await {
            Some(e) => e,
            None => return not_found_response(),
        };

        let workdir = job.workdir().await;
        let path = match safe_segment_path(workdir.as_path(), segment.as_str()) {
            Ok(e) => e,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &e),
        };

        // variant playlists receive the same uri rewrite as the master playlist
        if path
            .extension()
            .map(|e| e == PLAYLIST_EXTENSION)
            .unwrap_or(false)
        {
            return match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    let rewritten = rewrite_segment_urls(
                        content.as_str(),
                        tracks.audio_track,
                        tracks.subtitle_track,
                    );
                    Response::builder()
                        .status(StatusCode::OK)
                        .header(CONTENT_TYPE, PLAYLIST_CONTENT_TYPE)
                        .body(Body::from(rewritten))
                        .unwrap_or_else(handle_internal_error)
                }
                Err(_) => not_found_response(),
            };
        }

        match tokio::fs::read(&path).await {
            Ok(bytes) => Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, SEGMENT_CONTENT_TYPE)
                .header(CONTENT_LENGTH, bytes.len())
                .body(Body::from(bytes))
                .unwrap_or_else(handle_internal_error),
            Err(e) => {
                debug!("Segment {:?} could not be read, {}", path, e);
                not_found_response()
            }
        }
    }

    async fn post_seek(
        State(state): State<ApiState>,
        UrlPath((torrent_id, file_index)): UrlPath<(String, String)>,
        Query(query): Query<SeekQuery>,
    ) -> Response<Body> {
        let manager = match state.manager.as_ref() {
            Some(e) => e,
            None => return not_configured_response(),
        };
        let file_index = match parse_file_index(file_index.as_str()) {
            Ok(e) => e,
            Err(response) => return response,
        };
        let target = match query.time.as_deref().map(str::parse::<f64>) {
            Some(Ok(e)) if e >= 0.0 && e.is_finite() => e,
            _ => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &Error::InvalidRequest(
                        "the time query parameter is missing or invalid".to_string(),
                    ),
                )
            }
        };

        let key = JobKey {
            torrent_id,
            file_index,
            audio_track: query.audio_track,
            subtitle_track: query.subtitle_track,
        };
        debug!("Handling seek request to {}s for {}", target, key);
        let (job, mode) = match manager.seek_job(key, target, false).await {
            Ok(e) => e,
            Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
        };

        // hard seeks respond once the new pipeline has produced its playlist
        if mode == SeekMode::Hard {
            if let Err(e) = job.wait_ready().await {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e);
            }
        }

        Json(SeekResponse {
            seek_time: target,
            seek_mode: mode.as_str(),
        })
        .into_response()
    }

    async fn get_direct(
        State(state): State<ApiState>,
        UrlPath((torrent_id, file_index)): UrlPath<(String, String)>,
    ) -> Response<Body> {
        let manager = match state.manager.as_ref() {
            Some(e) => e,
            None => return not_configured_response(),
        };
        let file_index = match parse_file_index(file_index.as_str()) {
            Ok(e) => e,
            Err(response) => return response,
        };

        let file = match manager.resolve_file(torrent_id.as_str(), file_index).await {
            Ok(e) => e,
            Err(e) => {
                debug!("Direct playback file could not be resolved, {}", e);
                return not_found_response();
            }
        };

        // trust the on-disk size over a lagging bytes_completed counter
        let on_disk_length = tokio::fs::metadata(file.path.as_path())
            .await
            .map(|e| e.len())
            .unwrap_or(0);
        let complete = file.is_complete() || (file.length > 0 && on_disk_length == file.length);
        if !complete {
            return not_found_response();
        }

        let extension = file
            .path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if DIRECT_PLAY_EXTENSIONS.contains(&extension.as_str()) {
            return serve_media_file(file.path.as_path(), MP4_CONTENT_TYPE).await;
        }

        if extension == REMUX_EXTENSION {
            // only codec-copy capable sources can be remuxed for direct playback
            match manager.media_details(file.path.as_path()).await {
                Ok(details) if details.h264 => {}
                _ => return not_found_response(),
            }

            let key = RemuxKey {
                torrent_id,
                file_index,
            };
            let status = match manager.check_remux(&key).await {
                Some(e) => e,
                None => manager.trigger_remux(&key, file.path.clone()).await,
            };

            return if status.ready {
                serve_media_file(status.output.as_path(), MP4_CONTENT_TYPE).await
            } else {
                Response::builder()
                    .status(StatusCode::ACCEPTED)
                    .header(RETRY_AFTER, REMUX_RETRY_AFTER_SECS)
                    .body(Body::empty())
                    .unwrap_or_else(handle_internal_error)
            };
        }

        not_found_response()
    }

    async fn get_health(State(state): State<ApiState>) -> Response<Body> {
        match state.manager.as_ref() {
            Some(manager) => Json(manager.health().await).into_response(),
            None => not_configured_response(),
        }
    }
}

impl Drop for StreamApiServer {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            self.inner.cancellation_token.cancel();
        }
    }
}

#[derive(Debug)]
struct InnerStreamApiServer {
    addr: SocketAddr,
    cancellation_token: CancellationToken,
}

#[derive(Debug, Clone)]
struct ApiState {
    manager: Option<StreamJobManager>,
}

fn parse_file_index(value: &str) -> Result<usize, Response<Body>> {
    value.parse::<usize>().map_err(|_| {
        error_response(
            StatusCode::BAD_REQUEST,
            &Error::InvalidRequest(format!("file index {} is invalid", value)),
        )
    })
}

/// Serve the given media file with the DLNA streaming headers.
async fn serve_media_file(path: &Path, content_type: &str) -> Response<Body> {
    let file = match tokio::fs::File::open(path).await {
        Ok(e) => e,
        Err(e) => {
            debug!("Media file {:?} could not be opened, {}", path, e);
            return not_found_response();
        }
    };
    let length = match file.metadata().await {
        Ok(e) => e.len(),
        Err(_) => return not_found_response(),
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type)
        .header(CONTENT_LENGTH, length)
        .header(HEADER_DLNA_TRANSFER_MODE, DLNA_TRANSFER_MODE_TYPE)
        .header(HEADER_DLNA_REAL_TIME_INFO, DLNA_REAL_TIME_TYPE)
        .header(HEADER_DLNA_CONTENT_FEATURES, DLNA_CONTENT_FEATURES)
        .body(Body::from_stream(ReaderStream::new(file)))
        .unwrap_or_else(handle_internal_error)
}

fn error_response(status: StatusCode, error: &Error) -> Response<Body> {
    let envelope = ErrorEnvelope {
        error: ErrorBody {
            code: error.code().to_string(),
            message: error.to_string(),
        },
    };

    (status, Json(envelope)).into_response()
}

fn not_configured_response() -> Response<Body> {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, &Error::NotConfigured)
}

fn not_found_response() -> Response<Body> {
    (StatusCode::NOT_FOUND, Body::empty()).into_response()
}

fn handle_internal_error(err: axum::http::Error) -> Response<Body> {
    error!("Stream api request failed, {}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, Body::empty()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use peerflux_core::core::media::{MediaDetails, MockMediaProbe};
    use peerflux_core::core::stream::{
        MediaStreamUseCase, MockMediaStreamUseCase, MockRawMediaReader, RawMediaReader, RawStream,
    };
    use peerflux_core::core::torrents::{MockTorrentEngine, SessionState, TorrentFileInfo};
    use peerflux_core::init_logger;
    use reqwest::Client;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    const TORRENT_ID: &str = "0123456789abcdef0123456789abcdef01234567";

    fn write_transcoder(temp_dir: &TempDir, body: &str) -> PathBuf {
        let path = temp_dir.path().join("ffmpeg");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn media_file(temp_dir: &TempDir, filename: &str, contents: &str) -> TorrentFileInfo {
        let path = temp_dir.path().join(filename);
        fs::write(&path, contents).unwrap();

        TorrentFileInfo {
            index: 0,
            path,
            length: contents.len() as u64,
            bytes_completed: contents.len() as u64,
        }
    }

    fn engine_with_file(file: TorrentFileInfo) -> Arc<MockTorrentEngine> {
        let mut engine = MockTorrentEngine::new();
        engine.expect_session_state().returning(move |_| {
            Ok(SessionState {
                files: vec![file.clone()],
            })
        });
        engine
            .expect_set_piece_priority()
            .returning(|_, _, _, _| Ok(()));

        Arc::new(engine)
    }

    fn media_stream(file: TorrentFileInfo) -> Arc<MockMediaStreamUseCase> {
        let mut stream = MockMediaStreamUseCase::new();
        stream.expect_execute_raw().returning(move |_, _| {
            let mut reader = MockRawMediaReader::new();
            reader.expect_set_responsive().return_const(());
            reader.expect_close().return_const(());
            reader.expect_read().returning(|_| Ok(0));
            Ok(RawStream {
                reader: Box::new(reader),
                file: file.clone(),
            })
        });

        Arc::new(stream)
    }

    async fn manager_with(
        temp_dir: &TempDir,
        transcoder_body: &str,
        file: TorrentFileInfo,
        details: MediaDetails,
    ) -> StreamJobManager {
        let transcoder = write_transcoder(temp_dir, transcoder_body);
        let mut probe = MockMediaProbe::new();
        probe.expect_probe().returning(move |_| Ok(details.clone()));

        StreamJobManager::builder()
            .base_dir(temp_dir.path().join("streams"))
            .transcoder_binary(transcoder.to_string_lossy())
            .probe(Arc::new(probe))
            .stream(media_stream(file.clone()))
            .engine(engine_with_file(file))
            .build()
            .await
    }

    async fn start_server(manager: StreamJobManager) -> (StreamApiServer, String) {
        let server = StreamApiServer::new(Some(manager)).await.unwrap();
        let base_url = format!("http://{}", server.addr());

        (server, base_url)
    }

    #[tokio::test]
    async fn test_direct_playback_complete_mp4() {
        init_logger!();
        let temp_dir = tempfile::tempdir().unwrap();
        let contents = "lorem ipsum mp4!";
        let file = media_file(&temp_dir, "movie.mp4", contents);
        let manager = manager_with(&temp_dir, "true", file, MediaDetails::default()).await;
        let (_server, base_url) = start_server(manager).await;
        let client = Client::new();

        let response = client
            .get(format!("{}/torrents/{}/direct/0", base_url, TORRENT_ID))
            .send()
            .await
            .unwrap();

        assert_eq!(reqwest::StatusCode::OK, response.status());
        assert_eq!(
            DLNA_TRANSFER_MODE_TYPE,
            response
                .headers()
                .get(HEADER_DLNA_TRANSFER_MODE)
                .unwrap()
                .to_str()
                .unwrap()
        );
        assert_eq!(
            contents.len().to_string(),
            response
                .headers()
                .get(CONTENT_LENGTH.as_str())
                .unwrap()
                .to_str()
                .unwrap()
        );
        assert_eq!(contents, response.text().await.unwrap());
    }

    #[tokio::test]
    async fn test_direct_playback_head_request() {
        init_logger!();
        let temp_dir = tempfile::tempdir().unwrap();
        let file = media_file(&temp_dir, "movie.m4v", "lorem ipsum m4v!");
        let manager = manager_with(&temp_dir, "true", file, MediaDetails::default()).await;
        let (_server, base_url) = start_server(manager).await;
        let client = Client::new();

        let response = client
            .head(format!("{}/torrents/{}/direct/0", base_url, TORRENT_ID))
            .send()
            .await
            .unwrap();

        assert_eq!(reqwest::StatusCode::OK, response.status());
        assert_eq!("", response.text().await.unwrap());
    }

    #[tokio::test]
    async fn test_direct_playback_incomplete_file() {
        init_logger!();
        let temp_dir = tempfile::tempdir().unwrap();
        let mut file = media_file(&temp_dir, "movie.mp4", "lorem ipsum mp4!");
        file.length = 1000;
        file.bytes_completed = 500;
        let manager = manager_with(&temp_dir, "true", file, MediaDetails::default()).await;
        let (_server, base_url) = start_server(manager).await;

        let response = Client::new()
            .get(format!("{}/torrents/{}/direct/0", base_url, TORRENT_ID))
            .send()
            .await
            .unwrap();

        assert_eq!(reqwest::StatusCode::NOT_FOUND, response.status());
    }

    #[tokio::test]
    async fn test_direct_playback_unsupported_extension() {
        init_logger!();
        let temp_dir = tempfile::tempdir().unwrap();
        let file = media_file(&temp_dir, "movie.avi", "lorem ipsum avi!");
        let manager = manager_with(&temp_dir, "true", file, MediaDetails::default()).await;
        let (_server, base_url) = start_server(manager).await;

        let response = Client::new()
            .get(format!("{}/torrents/{}/direct/0", base_url, TORRENT_ID))
            .send()
            .await
            .unwrap();

        assert_eq!(reqwest::StatusCode::NOT_FOUND, response.status());
    }

    #[tokio::test]
    async fn test_direct_playback_mkv_remux() {
        init_logger!();
        let temp_dir = tempfile::tempdir().unwrap();
        let contents = "lorem ipsum mkv!";
        let file = media_file(&temp_dir, "movie.mkv", contents);
        let details = MediaDetails {
            h264: true,
            aac: true,
            ..Default::default()
        };
        // the fake transcoder copies its input to its last argument
        let manager = manager_with(
            &temp_dir,
            "input=\"\"\nprev=\"\"\nfor arg; do\n  if [ \"$prev\" = \"-i\" ]; then input=\"$arg\"; fi\n  prev=\"$arg\"\ndone\nfor last; do :; done\ncp \"$input\" \"$last\"",
            file,
            details,
        )
        .await;
        let (_server, base_url) = start_server(manager.clone()).await;
        let client = Client::new();
        let url = format!("{}/torrents/{}/direct/0", base_url, TORRENT_ID);

        let response = client.get(url.as_str()).send().await.unwrap();
        assert_eq!(reqwest::StatusCode::ACCEPTED, response.status());
        assert_eq!(
            REMUX_RETRY_AFTER_SECS,
            response
                .headers()
                .get(RETRY_AFTER.as_str())
                .unwrap()
                .to_str()
                .unwrap()
        );

        let key = RemuxKey {
            torrent_id: TORRENT_ID.to_string(),
            file_index: 0,
        };
        let ready = tokio::time::timeout(Duration::from_secs(5), manager.remux().wait_ready(&key))
            .await
            .expect("expected the remux to complete");
        assert_eq!(true, ready);

        let response = client.get(url.as_str()).send().await.unwrap();
        assert_eq!(reqwest::StatusCode::OK, response.status());
        assert_eq!(contents, response.text().await.unwrap());
    }

    #[tokio::test]
    async fn test_playlist_and_segment() {
        init_logger!();
        let temp_dir = tempfile::tempdir().unwrap();
        let file = media_file(&temp_dir, "movie.mp4", "lorem ipsum mp4!");
        let details = MediaDetails {
            h264: true,
            aac: true,
            duration: Some(600.0),
            ..Default::default()
        };
        let manager = manager_with(
            &temp_dir,
            "printf 'data' > seg-00000.ts\nprintf '#EXTM3U\\n#EXTINF:4.0,\\nseg-00000.ts\\n#EXT-X-ENDLIST\\n' > index.m3u8",
            file,
            details,
        )
        .await;
        let (_server, base_url) = start_server(manager).await;
        let client = Client::new();

        let response = client
            .get(format!(
                "{}/torrents/{}/hls/0/index.m3u8?audioTrack=1",
                base_url, TORRENT_ID
            ))
            .send()
            .await
            .unwrap();

        assert_eq!(reqwest::StatusCode::OK, response.status());
        assert_eq!(
            PLAYLIST_CONTENT_TYPE,
            response
                .headers()
                .get(CONTENT_TYPE.as_str())
                .unwrap()
                .to_str()
                .unwrap()
        );
        let playlist = response.text().await.unwrap();
        assert!(
            playlist.contains("seg-00000.ts?audioTrack=1"),
            "expected the segment uris to be rewritten, but got {}",
            playlist
        );

        let response = client
            .get(format!(
                "{}/torrents/{}/hls/0/seg-00000.ts?audioTrack=1",
                base_url, TORRENT_ID
            ))
            .send()
            .await
            .unwrap();

        assert_eq!(reqwest::StatusCode::OK, response.status());
        assert_eq!("data", response.text().await.unwrap());
    }

    #[tokio::test]
    async fn test_segment_traversal_is_rejected() {
        init_logger!();
        let temp_dir = tempfile::tempdir().unwrap();
        let file = media_file(&temp_dir, "movie.mp4", "lorem ipsum mp4!");
        let manager = manager_with(
            &temp_dir,
            "printf '#EXTM3U\\n#EXTINF:4.0,\\nseg-00000.ts\\n#EXT-X-ENDLIST\\n' > index.m3u8",
            file,
            MediaDetails::default(),
        )
        .await;
        let (_server, base_url) = start_server(manager.clone()).await;
        let client = Client::new();

        // register the job first through a playlist request
        client
            .get(format!(
                "{}/torrents/{}/hls/0/index.m3u8",
                base_url, TORRENT_ID
            ))
            .send()
            .await
            .unwrap();

        let response = client
            .get(format!(
                "{}/torrents/{}/hls/0/..%2Fsecret.ts",
                base_url, TORRENT_ID
            ))
            .send()
            .await
            .unwrap();

        assert_eq!(reqwest::StatusCode::BAD_REQUEST, response.status());
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!("invalid_request", body["error"]["code"]);
    }

    #[tokio::test]
    async fn test_seek_invalid_time() {
        init_logger!();
        let temp_dir = tempfile::tempdir().unwrap();
        let file = media_file(&temp_dir, "movie.mp4", "lorem ipsum mp4!");
        let manager = manager_with(&temp_dir, "true", file, MediaDetails::default()).await;
        let (_server, base_url) = start_server(manager).await;
        let client = Client::new();

        for query in ["", "?time=", "?time=lorem", "?time=-5"] {
            let response = client
                .post(format!(
                    "{}/torrents/{}/hls/0/seek{}",
                    base_url, TORRENT_ID, query
                ))
                .send()
                .await
                .unwrap();

            assert_eq!(
                reqwest::StatusCode::BAD_REQUEST,
                response.status(),
                "expected a bad request for query {:?}",
                query
            );
            let body: serde_json::Value = response.json().await.unwrap();
            assert_eq!("invalid_request", body["error"]["code"]);
        }
    }

    #[tokio::test]
    async fn test_seek_rejects_non_post() {
        init_logger!();
        let temp_dir = tempfile::tempdir().unwrap();
        let file = media_file(&temp_dir, "movie.mp4", "lorem ipsum mp4!");
        let manager = manager_with(&temp_dir, "true", file, MediaDetails::default()).await;
        let (_server, base_url) = start_server(manager).await;

        let response = Client::new()
            .get(format!(
                "{}/torrents/{}/hls/0/seek?time=10",
                base_url, TORRENT_ID
            ))
            .send()
            .await
            .unwrap();

        assert_eq!(reqwest::StatusCode::METHOD_NOT_ALLOWED, response.status());
    }

    /// A stream use case which resolves its raw stream slowly, mimicking a
    /// torrent session which still has to come up.
    #[derive(Debug)]
    struct SlowMediaStream {
        file: TorrentFileInfo,
        delay: Duration,
    }

    #[async_trait]
    impl MediaStreamUseCase for SlowMediaStream {
        async fn execute_raw(
            &self,
            _torrent_id: &str,
            _file_index: usize,
        ) -> peerflux_core::core::stream::Result<RawStream> {
            tokio::time::sleep(self.delay).await;
            let mut reader = MockRawMediaReader::new();
            reader.expect_set_responsive().return_const(());
            reader.expect_close().return_const(());
            reader.expect_read().returning(|_| Ok(0));

            Ok(RawStream {
                reader: Box::new(reader) as Box<dyn RawMediaReader>,
                file: self.file.clone(),
            })
        }
    }

    #[tokio::test]
    async fn test_seek_during_startup_waits_for_the_job() {
        init_logger!();
        let temp_dir = tempfile::tempdir().unwrap();
        let file = media_file(&temp_dir, "movie.mp4", "lorem ipsum mp4!");
        let transcoder = write_transcoder(
            &temp_dir,
            "printf '#EXTM3U\\n#EXTINF:4.0,\\nseg-00000.ts\\n' > index.m3u8\nsleep 30",
        );
        let mut probe = MockMediaProbe::new();
        probe
            .expect_probe()
            .returning(|_| Ok(MediaDetails::default()));
        let manager = StreamJobManager::builder()
            .base_dir(temp_dir.path().join("streams"))
            .transcoder_binary(transcoder.to_string_lossy())
            .probe(Arc::new(probe))
            .stream(Arc::new(SlowMediaStream {
                file,
                delay: Duration::from_millis(1500),
            }))
            .build()
            .await;
        let (_server, base_url) = start_server(manager.clone()).await;
        let start = Instant::now();

        let response = Client::new()
            .post(format!(
                "{}/torrents/{}/hls/0/seek?time=120",
                base_url, TORRENT_ID
            ))
            .send()
            .await
            .unwrap();

        assert_eq!(reqwest::StatusCode::OK, response.status());
        assert!(
            start.elapsed() >= Duration::from_secs(1),
            "expected the request to have waited on the startup"
        );
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(120.0, body["seekTime"]);
        assert_eq!("hard", body["seekMode"]);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_health() {
        init_logger!();
        let temp_dir = tempfile::tempdir().unwrap();
        let file = media_file(&temp_dir, "movie.mp4", "lorem ipsum mp4!");
        let manager = manager_with(&temp_dir, "true", file, MediaDetails::default()).await;
        let (_server, base_url) = start_server(manager).await;

        let response = Client::new()
            .get(format!("{}/health", base_url))
            .send()
            .await
            .unwrap();

        assert_eq!(reqwest::StatusCode::OK, response.status());
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(0, body["activeJobs"]);
        assert_eq!(0, body["totalJobStarts"]);
    }

    #[tokio::test]
    async fn test_not_configured() {
        init_logger!();
        let server = StreamApiServer::new(None).await.unwrap();
        let base_url = format!("http://{}", server.addr());

        let response = Client::new()
            .get(format!(
                "{}/torrents/{}/hls/0/index.m3u8",
                base_url, TORRENT_ID
            ))
            .send()
            .await
            .unwrap();

        assert_eq!(
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            response.status()
        );
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!("not_configured", body["error"]["code"]);
    }
}
