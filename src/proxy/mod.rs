use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use log::{debug, error, warn};
use tokio_stream::wrappers::ReceiverStream;
use url::Url;

use crate::http::{base_response, decoded_query_param, full_body, text};
use crate::settings::Settings;

pub mod cache;
pub mod rewrite;

use cache::SegmentCache;

type HttpBody = http_body_util::combinators::BoxBody<Bytes, anyhow::Error>;

pub const MAX_REDIRECTS: usize = 5;

pub fn build_client(settings: &Settings) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_millis(settings.fetch_timeout_ms))
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .user_agent(settings.user_agent.clone())
        .build()?)
}

/// CORS rewriting proxy: fetches upstream playlists and segments, rewrites
/// playlist URIs through itself and caches segment bodies in memory.
#[derive(Clone)]
pub struct ProxyServer {
    client: reqwest::Client,
    cache: Arc<SegmentCache>,
}

impl ProxyServer {
    pub fn new(client: reqwest::Client, cache: Arc<SegmentCache>) -> Self {
        Self { client, cache }
    }

    async fn handle(self, req: Request<Incoming>) -> Result<Response<HttpBody>> {
        if req.method() == Method::OPTIONS {
            return preflight();
        }
        if req.method() != Method::GET {
            return text(
                StatusCode::METHOD_NOT_ALLOWED,
                "text/plain",
                "Method Not Allowed",
            );
        }
        match req.uri().path() {
            "/health" => text(StatusCode::OK, "text/plain", "ok"),
            "/status" => self.status(),
            "/m3u8" => self.playlist(&req).await,
            "/seg" => self.segment(&req).await,
            _ => text(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
        }
    }

    fn status(&self) -> Result<Response<HttpBody>> {
        let body = serde_json::json!({
            "cache_items": self.cache.len(),
            "cache_hits": self.cache.hits(),
            "cache_misses": self.cache.misses(),
        })
        .to_string();
        text(StatusCode::OK, "application/json", &body)
    }

    async fn playlist(&self, req: &Request<Incoming>) -> Result<Response<HttpBody>> {
        let upstream = match decoded_query_param(req.uri().query(), "q") {
            Some(u) if !u.is_empty() => u.into_owned(),
            _ => return text(StatusCode::BAD_REQUEST, "text/plain", "q= required"),
        };

        let rsp = match self.client.get(&upstream).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("upstream fetch failed for {}: {}", upstream, e);
                return text(StatusCode::BAD_GATEWAY, "text/plain", "Upstream start failed");
            }
        };
        if !rsp.status().is_success() {
            warn!("upstream returned {} for {}", rsp.status(), upstream);
            return text(StatusCode::BAD_GATEWAY, "text/plain", "Upstream start failed");
        }

        // redirects may have moved us; resolve children against where the
        // playlist actually came from
        let base: Url = rsp.url().clone();
        let body = match rsp.bytes().await {
            Ok(b) => b,
            Err(e) => {
                warn!("upstream read failed for {}: {}", upstream, e);
                return text(StatusCode::BAD_GATEWAY, "text/plain", "Upstream start failed");
            }
        };
        let rewritten = rewrite::rewrite_playlist(&base, &String::from_utf8_lossy(&body));
        debug!("rewrote playlist {} ({} bytes)", upstream, rewritten.len());

        Ok(base_response(StatusCode::OK)
            .header("content-type", "application/vnd.apple.mpegurl")
            .header("cache-control", "no-cache")
            .body(full_body(rewritten))?)
    }

    async fn segment(&self, req: &Request<Incoming>) -> Result<Response<HttpBody>> {
        let upstream = match decoded_query_param(req.uri().query(), "u") {
            Some(u) if !u.is_empty() => u.into_owned(),
            _ => return text(StatusCode::BAD_REQUEST, "text/plain", "u= required"),
        };

        if let Some(bytes) = self.cache.find(&upstream) {
            return Ok(base_response(StatusCode::OK)
                .header("content-type", "video/MP2T")
                .header("content-length", bytes.len())
                .body(full_body(bytes))?);
        }

        let rsp = match self.client.get(&upstream).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("upstream fetch failed for {}: {}", upstream, e);
                return text(StatusCode::BAD_GATEWAY, "text/plain", "Upstream start failed");
            }
        };
        if !rsp.status().is_success() {
            return text(StatusCode::BAD_GATEWAY, "text/plain", "Upstream start failed");
        }
        let content_type = rsp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("video/MP2T")
            .to_string();

        // stream to the client while growing the cache copy; only a fully
        // received body is inserted
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Frame<Bytes>>>(16);
        let cache = self.cache.clone();
        tokio::spawn(async move {
            let mut stream = rsp.bytes_stream();
            let mut agg = BytesMut::new();
            let mut complete = true;
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        agg.extend_from_slice(&bytes);
                        if tx.send(Ok(Frame::data(bytes))).await.is_err() {
                            complete = false;
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("upstream body error for {}: {}", upstream, e);
                        let _ = tx.send(Err(anyhow!(e))).await;
                        complete = false;
                        break;
                    }
                }
            }
            if complete {
                cache.insert(upstream, agg.freeze());
            }
        });

        let body = StreamBody::new(ReceiverStream::new(rx)).boxed();
        Ok(base_response(StatusCode::OK)
            .header("content-type", content_type)
            .body(body)?)
    }
}

impl Service<Request<Incoming>> for ProxyServer {
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

fn preflight() -> Result<Response<HttpBody>> {
    Ok(base_response(StatusCode::NO_CONTENT)
        .header("access-control-allow-methods", "GET, OPTIONS")
        .header("access-control-allow-headers", "*")
        .header("access-control-max-age", "600")
        .body(HttpBody::default())?)
}
