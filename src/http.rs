use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::http::response::Builder;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use log::{error, info};

use crate::pipeline::StreamShared;
use crate::registry::StreamRegistry;
use crate::settings::Settings;

pub const SERVER_NAME: &str = "streamgate";

type HttpBody = BoxBody<Bytes, anyhow::Error>;

/// HLS frontend: playlists, segments and the health/status probes.
#[derive(Clone)]
pub struct GatewayServer {
    registry: Arc<StreamRegistry>,
    settings: Settings,
}

impl GatewayServer {
    pub fn new(registry: Arc<StreamRegistry>) -> Self {
        let settings = registry.settings().clone();
        Self { registry, settings }
    }

    async fn handle(self, req: Request<Incoming>) -> Result<Response<HttpBody>> {
        if req.method() == Method::OPTIONS {
            return preflight();
        }
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return text(
                StatusCode::METHOD_NOT_ALLOWED,
                "text/plain",
                "Method Not Allowed",
            );
        }
        let path = req.uri().path().to_string();
        match path.as_str() {
            "/health" => text(StatusCode::OK, "text/plain", "ok"),
            "/status" => self.status(),
            "/m3u8" => self.playlist(&req).await,
            _ if path.starts_with("/seg_") => self.segment(&req, &path),
            _ => text(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
        }
    }

    fn status(&self) -> Result<Response<HttpBody>> {
        let body = serde_json::json!({
            "active_streams": self.registry.active_count(),
            "max_streams": self.settings.max_streams,
            "seg_ms": self.settings.seg_ms,
            "segment_count": self.settings.segment_count,
            "aac_bitrate": self.settings.aac_br,
            "aac_sample_rate": self.settings.aac_sr,
            "aac_channels": self.settings.aac_ch,
            "stream_timeout_sec": self.settings.stream_timeout_sec,
        })
        .to_string();
        text(StatusCode::OK, "application/json", &body)
    }

    async fn playlist(&self, req: &Request<Incoming>) -> Result<Response<HttpBody>> {
        let url = match decoded_query_param(req.uri().query(), "q") {
            Some(u) if !u.is_empty() => u.into_owned(),
            _ => return text(StatusCode::BAD_REQUEST, "text/plain", "q= required"),
        };

        info!("playlist request for {}", url);
        let registry = self.registry.clone();
        let lookup_url = url.clone();
        let created =
            tokio::task::spawn_blocking(move || registry.get_or_create(&lookup_url)).await?;
        let shared = match created {
            Ok(s) => s,
            Err(e) => {
                error!("cannot start transcoder for {}: {}", url, e);
                return text(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    "Cannot start transcoder",
                );
            }
        };

        let playlist = build_playlist(&shared, self.settings.seg_ms);
        Ok(base_response(StatusCode::OK)
            .header("content-type", "application/vnd.apple.mpegurl")
            .header("cache-control", "no-cache")
            .body(full_body(playlist))?)
    }

    fn segment(&self, req: &Request<Incoming>, path: &str) -> Result<Response<HttpBody>> {
        let Some(number) = parse_segment_path(path) else {
            return text(StatusCode::BAD_REQUEST, "text/plain", "Invalid segment");
        };
        let hash = match raw_query_param(req.uri().query(), "h")
            .and_then(|h| u32::from_str_radix(h, 16).ok())
        {
            Some(h) => h,
            None => return text(StatusCode::BAD_REQUEST, "text/plain", "h= required"),
        };

        let Some(shared) = self.registry.find_by_hash(hash) else {
            return text(StatusCode::NOT_FOUND, "text/plain", "Stream not found");
        };

        let bytes = {
            let state = shared.state.lock().unwrap();
            state
                .ring
                .get(number)
                .map(|seg| Bytes::copy_from_slice(seg.buf.as_slice()))
        };
        let Some(bytes) = bytes else {
            return text(StatusCode::NOT_FOUND, "text/plain", "Segment not found");
        };

        let rsp = base_response(StatusCode::OK)
            .header("content-type", "video/MP2T")
            .header("content-length", bytes.len());
        if req.method() == Method::HEAD {
            return Ok(rsp.body(HttpBody::default())?);
        }
        Ok(rsp.body(full_body(bytes))?)
    }
}

impl Service<Request<Incoming>> for GatewayServer {
    type Response = Response<HttpBody>;
    type Error = anyhow::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let server = self.clone();
        Box::pin(async move {
            match server.handle(req).await {
                Ok(rsp) => Ok(rsp),
                Err(e) => {
                    error!("{}", e);
                    Ok(Response::builder()
                        .status(StatusCode::INTERNAL_SERVER_ERROR)
                        .body(HttpBody::default())?)
                }
            }
        })
    }
}

/// Live HLS v3 media playlist over the current ready window, capped at 10
/// entries from the oldest end so MEDIA-SEQUENCE always matches the first
/// listed segment.
pub fn build_playlist(shared: &StreamShared, seg_ms: u64) -> String {
    let target_duration = seg_ms.div_ceil(1000);
    let state = shared.state.lock().unwrap();
    let window = state.ring.ready_window();
    let first = window.first().map(|s| s.number).unwrap_or(0);

    let mut out = String::with_capacity(512);
    out.push_str("#EXTM3U\n#EXT-X-VERSION:3\n");
    out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", target_duration));
    out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", first));
    for seg in window.iter().take(10) {
        out.push_str(&format!(
            "#EXTINF:{:.3},\nseg_{:03}.ts?h={:x}\n",
            seg_ms as f64 / 1000.0,
            seg.number,
            shared.hash
        ));
    }
    out
}

/// Raw (still percent-encoded) value of one query parameter.
pub fn raw_query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
    query?
        .split('&')
        .find_map(|kv| kv.strip_prefix(key)?.strip_prefix('='))
}

/// Percent-decoded value of one query parameter. `+` is not treated as a
/// space; upstream URLs must survive the round trip byte for byte.
pub fn decoded_query_param<'a>(query: Option<&'a str>, key: &str) -> Option<Cow<'a, str>> {
    urlencoding::decode(raw_query_param(query, key)?).ok()
}

/// Parse "/seg_<n>.ts" (zero padding optional).
pub fn parse_segment_path(path: &str) -> Option<u64> {
    path.strip_prefix("/seg_")?
        .strip_suffix(".ts")?
        .parse()
        .ok()
}

pub fn base_response(status: StatusCode) -> Builder {
    Response::builder()
        .status(status)
        .header("server", SERVER_NAME)
        .header("access-control-allow-origin", "*")
        .header("access-control-expose-headers", "*")
}

pub fn full_body(bytes: impl Into<Bytes>) -> HttpBody {
    Full::new(bytes.into()).map_err(|e| match e {}).boxed()
}

pub fn text(status: StatusCode, content_type: &str, body: &str) -> Result<Response<HttpBody>> {
    Ok(base_response(status)
        .header("content-type", content_type)
        .body(full_body(body.to_string()))?)
}

pub fn preflight() -> Result<Response<HttpBody>> {
    Ok(base_response(StatusCode::NO_CONTENT)
        .header("access-control-allow-methods", "GET, HEAD, OPTIONS")
        .header("access-control-allow-headers", "*")
        .header("access-control-max-age", "600")
        .body(HttpBody::default())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Transcoder;
    use crate::registry::hash_url;

    fn shared_with_segments(url: &str, count: usize) -> Arc<StreamShared> {
        let settings = Settings::default();
        let t = Transcoder::dummy(url, &settings);
        {
            let mut state = t.shared.state.lock().unwrap();
            for _ in 0..count {
                state.ring.push_ready(b"tsdata");
            }
        }
        t.shared.clone()
    }

    #[test]
    fn playlist_header_with_empty_ring() {
        let shared = shared_with_segments("http://ex.test/a", 0);
        let pl = build_playlist(&shared, 1000);
        assert!(pl.starts_with("#EXTM3U\n#EXT-X-VERSION:3\n"));
        assert!(pl.contains("#EXT-X-TARGETDURATION:1\n"));
        assert!(pl.contains("#EXT-X-MEDIA-SEQUENCE:0\n"));
        assert!(!pl.contains("#EXTINF"));
        assert!(!pl.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn playlist_lists_contiguous_window() {
        let shared = shared_with_segments("http://ex.test/a", 3);
        let pl = build_playlist(&shared, 1500);
        assert!(pl.contains("#EXT-X-TARGETDURATION:2\n"));
        assert!(pl.contains("#EXT-X-MEDIA-SEQUENCE:0\n"));
        let h = hash_url("http://ex.test/a");
        for n in 0..3 {
            assert!(pl.contains(&format!("seg_{:03}.ts?h={:x}\n", n, h)));
        }
        assert_eq!(pl.matches("#EXTINF:1.500,").count(), 3);
    }

    #[test]
    fn playlist_caps_at_ten_entries() {
        let shared = shared_with_segments("http://ex.test/a", 20);
        let pl = build_playlist(&shared, 1000);
        assert_eq!(pl.matches("#EXTINF").count(), 10);
        // ring capacity 24: all 20 ready, listed from the oldest
        assert!(pl.contains("#EXT-X-MEDIA-SEQUENCE:0\n"));
        assert!(pl.contains("seg_000.ts"));
        assert!(!pl.contains("seg_010.ts"));
    }

    #[test]
    fn playlist_parses_as_media_playlist() {
        let shared = shared_with_segments("http://ex.test/a", 5);
        let pl = build_playlist(&shared, 1000);
        let parsed = m3u8_rs::parse_playlist(pl.as_bytes())
            .expect("playlist must parse")
            .1;
        match parsed {
            m3u8_rs::Playlist::MediaPlaylist(mp) => {
                assert_eq!(mp.version, Some(3));
                assert_eq!(mp.media_sequence, 0);
                assert_eq!(mp.target_duration, 1.0);
                assert!(!mp.end_list);
                assert_eq!(mp.segments.len(), 5);
            }
            _ => panic!("expected media playlist"),
        }
    }

    #[test]
    fn media_sequence_advances_on_ring_wrap() {
        let settings = Settings::default();
        let t = Transcoder::dummy("http://ex.test/a", &settings);
        {
            let mut state = t.shared.state.lock().unwrap();
            for _ in 0..state.ring.capacity() {
                state.ring.push_ready(b"x");
            }
        }
        let before = build_playlist(&t.shared, 1000);
        assert!(before.contains("#EXT-X-MEDIA-SEQUENCE:0\n"));
        t.shared.state.lock().unwrap().ring.push_ready(b"x");
        let after = build_playlist(&t.shared, 1000);
        assert!(after.contains("#EXT-X-MEDIA-SEQUENCE:1\n"));
    }

    #[test]
    fn query_param_parsing() {
        assert_eq!(
            raw_query_param(Some("q=http%3A%2F%2Fex.test%2Fa&x=1"), "q"),
            Some("http%3A%2F%2Fex.test%2Fa")
        );
        assert_eq!(
            decoded_query_param(Some("q=http%3A%2F%2Fex.test%2Fa"), "q").as_deref(),
            Some("http://ex.test/a")
        );
        assert_eq!(raw_query_param(Some("h=deadbeef"), "q"), None);
        assert_eq!(raw_query_param(None, "q"), None);
        // plus signs survive as-is
        assert_eq!(
            decoded_query_param(Some("q=a%2Bb+c"), "q").as_deref(),
            Some("a+b+c")
        );
    }

    #[test]
    fn segment_path_parsing() {
        assert_eq!(parse_segment_path("/seg_005.ts"), Some(5));
        assert_eq!(parse_segment_path("/seg_5.ts"), Some(5));
        assert_eq!(parse_segment_path("/seg_1234.ts"), Some(1234));
        assert_eq!(parse_segment_path("/seg_.ts"), None);
        assert_eq!(parse_segment_path("/seg_xx.ts"), None);
        assert_eq!(parse_segment_path("/segment_1.ts"), None);
    }

    #[test]
    fn url_codec_round_trip() {
        let original = "http://host:8080/path/ch?id=3&tok=a_b-c.d~e";
        let encoded = urlencoding::encode(original);
        assert_eq!(urlencoding::decode(&encoded).unwrap(), original);
    }
}
