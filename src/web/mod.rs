// This file is part of Osprey DVR, a security camera recording aggregator.
// Copyright (C) 2021 The Osprey DVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

mod path;

use self::path::Path;
use crate::body::{Body, BoxedError, Chunk};
use crate::dvr::Dvr;
use crate::events;
use base::clock::{Clocks, RealClocks};
use base::ErrorKind;
use http::header::{self, HeaderValue};
use http::method::Method;
use http::{status::StatusCode, Request, Response};
use http_serve::dir::FsDir;
use log::{debug, warn};
use percent_encoding::percent_decode_str;
use std::borrow::Cow;
use std::sync::Arc;
use url::form_urlencoded;

/// Cap on the composed `/dvr/status` document.
const STATUS_BUF_LEN: usize = 1 << 16;

/// Cap on any one browse response; the daily listing is the big one.
const BROWSE_BUF_LEN: usize = 640 << 10;

/// An HTTP error response.
/// This is a thin wrapper over the hyper response type; it doesn't even verify
/// that the response actually uses a non-2xx status code. Its purpose is to
/// allow automatic conversion from `base::Error`. Rust's orphan rule prevents
/// this crate from defining a direct conversion from `base::Error` to
/// `hyper::Response`.
struct HttpError(Response<Body>);

impl From<Response<Body>> for HttpError {
    fn from(response: Response<Body>) -> Self {
        HttpError(response)
    }
}

impl From<base::Error> for HttpError {
    fn from(err: base::Error) -> Self {
        HttpError(from_base_error(err))
    }
}

fn plain_response<B: Into<Body>>(status: http::StatusCode, body: B) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))
        .body(body.into())
        .expect("hardcoded head should be valid")
}

fn not_found<B: Into<Body>>(body: B) -> HttpError {
    HttpError(plain_response(StatusCode::NOT_FOUND, body))
}

fn bad_req<B: Into<Body>>(body: B) -> HttpError {
    HttpError(plain_response(StatusCode::BAD_REQUEST, body))
}

fn internal_server_err<E: Into<failure::Error>>(err: E) -> HttpError {
    HttpError(plain_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        err.into().to_string(),
    ))
}

fn from_base_error(err: base::Error) -> Response<Body> {
    use ErrorKind::*;
    let status_code = match err.kind() {
        Unauthenticated => StatusCode::UNAUTHORIZED,
        PermissionDenied => StatusCode::FORBIDDEN,
        InvalidArgument | FailedPrecondition => StatusCode::BAD_REQUEST,
        NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    plain_response(status_code, err.to_string())
}

type ResponseResult = Result<Response<Body>, HttpError>;

/// Serializes `out` into one JSON response, refusing documents beyond `cap`.
/// The cap plays the role of the fixed composing buffer this protocol grew up
/// with: oversized documents answer 413 rather than stream partial output.
fn serve_json<T: serde::ser::Serialize>(out: &T, cap: usize) -> ResponseResult {
    let body = serde_json::to_vec(out).map_err(|e| internal_server_err(failure::err_msg(e)))?;
    if body.len() > cap {
        events::trace("BUFFER", "overflow");
        return Err(HttpError(plain_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "Payload too large",
        )));
    }
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        )
        .body(body.into())
        .expect("hardcoded head should be valid"))
}

/// Returns a decoded query parameter, `form_urlencoded` rules (`+` is a
/// space).
fn query_param<'a>(req: &'a Request<hyper::Body>, key: &str) -> Option<Cow<'a, str>> {
    let q = req.uri().query()?;
    form_urlencoded::parse(q.as_bytes())
        .find(|(k, _)| k.as_ref() == key)
        .map(|(_, v)| v)
}

/// Returns a percent-decoded query parameter with `+` left alone. The
/// download filters and the declare device list use `+` as a delimiter, not
/// as an encoded space.
fn raw_query_param<'a>(req: &'a Request<hyper::Body>, key: &str) -> Option<Cow<'a, str>> {
    let q = req.uri().query()?;
    for pair in q.split('&') {
        let (k, v) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        if k == key {
            return Some(percent_decode_str(v).decode_utf8_lossy());
        }
    }
    None
}

fn required_int<T: std::str::FromStr>(
    req: &Request<hyper::Body>,
    key: &'static str,
) -> Result<T, HttpError> {
    let v = query_param(req, key).ok_or_else(|| bad_req(format!("missing {}", key)))?;
    v.parse()
        .map_err(|_| bad_req(format!("unparseable {}", key)))
}

/// Splits a `cam` filter into matcher tokens. `+` separates tokens; an empty
/// piece (from a doubled or trailing `+`) marks the preceding token as
/// matching every sequence suffix.
fn parse_cam_tokens(raw: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for piece in raw.split('+') {
        if piece.is_empty() {
            if let Some(last) = tokens.last_mut() {
                if !last.ends_with('+') {
                    last.push('+');
                }
            }
        } else {
            tokens.push(piece.to_owned());
        }
    }
    tokens
}

pub struct Config<'a> {
    pub dvr: Arc<Dvr>,
    pub ui_dir: Option<&'a std::path::Path>,
}

pub struct Service {
    dvr: Arc<Dvr>,
    ui_dir: Option<Arc<FsDir>>,
    archive_dir: Option<Arc<FsDir>>,
    clocks: RealClocks,
}

impl Service {
    pub fn new(config: Config) -> Result<Self, failure::Error> {
        let mut ui_dir = None;
        if let Some(d) = config.ui_dir {
            match FsDir::builder().for_path(d) {
                Err(e) => {
                    warn!(
                        "Unable to load --ui-dir={}; will serve no static files: {}",
                        d.display(),
                        e
                    );
                }
                Ok(d) => ui_dir = Some(d),
            };
        }
        let archive_dir = match FsDir::builder().for_path(config.dvr.store.root()) {
            Err(e) => {
                warn!(
                    "Unable to open archive root {}; raw video access disabled: {}",
                    config.dvr.store.root().display(),
                    e
                );
                None
            }
            Ok(d) => Some(d),
        };
        Ok(Service {
            dvr: config.dvr,
            ui_dir,
            archive_dir,
            clocks: RealClocks {},
        })
    }

    /// Serves an HTTP request.
    /// An error return from this method causes hyper to abruptly drop the
    /// HTTP connection rather than respond. That's not terribly useful, so this
    /// method always returns `Ok`. It delegates to a `serve_inner` which is
    /// allowed to generate `Err` results with the `?` operator, but returns
    /// them to hyper as `Ok` results.
    pub async fn serve(
        self: Arc<Self>,
        req: Request<::hyper::Body>,
    ) -> Result<Response<Body>, std::convert::Infallible> {
        let p = Path::decode(req.uri().path());
        debug!("request on: {}: {:?}", req.uri(), p);
        Ok(self.serve_inner(req, p).await.unwrap_or_else(|e| e.0))
    }

    async fn serve_inner(
        self: Arc<Self>,
        req: Request<::hyper::Body>,
        p: Path,
    ) -> ResponseResult {
        if !matches!(*req.method(), Method::GET | Method::HEAD | Method::POST) {
            return Err(
                plain_response(StatusCode::METHOD_NOT_ALLOWED, "GET, HEAD, or POST expected")
                    .into(),
            );
        }
        match p {
            Path::Status => self.status(&req),
            Path::StorageTop => serve_json(&self.dvr.store.top()?, BROWSE_BUF_LEN),
            Path::StorageYearly => {
                let year = required_int::<i32>(&req, "year")?;
                serve_json(&self.dvr.store.yearly(year), BROWSE_BUF_LEN)
            }
            Path::StorageMonthly => {
                let year = required_int::<i32>(&req, "year")?;
                let month = required_int::<u32>(&req, "month")?;
                serve_json(&self.dvr.store.monthly(year, month)?, BROWSE_BUF_LEN)
            }
            Path::StorageDaily => {
                let year = required_int::<i32>(&req, "year")?;
                let month = required_int::<u32>(&req, "month")?;
                let day = required_int::<u32>(&req, "day")?;
                serve_json(&self.dvr.store.daily(year, month, day)?, BROWSE_BUF_LEN)
            }
            Path::StorageDownload => self.download(&req),
            Path::Video => self.video(req).await,
            Path::Declare => self.declare(&req),
            Path::Static => self.static_file(req).await,
            Path::NotFound => Err(not_found("path not understood")),
        }
    }

    /// Composes the combined status document. Each component contributes its
    /// own section; the sections are captured non-atomically and stamped with
    /// the assembly time.
    fn status(&self, _req: &Request<::hyper::Body>) -> ResponseResult {
        let (servers, feed) = self.dvr.feeds.lock().status();
        let storage = self.dvr.store.status()?;
        let queue = self.dvr.queue.lock().status();
        let doc = crate::json::TopLevel {
            host: &self.dvr.host,
            proxy: &self.dvr.proxy,
            timestamp: self.clocks.realtime().sec,
            dvr: crate::json::DvrStatus {
                servers,
                feed,
                storage,
                queue,
            },
        };
        serve_json(&doc, STATUS_BUF_LEN)
    }

    fn download(&self, req: &Request<::hyper::Body>) -> ResponseResult {
        let year = required_int::<i32>(req, "year")?;
        let month = required_int::<u32>(req, "month")?;
        let day = required_int::<u32>(req, "day")?;
        let hours = match raw_query_param(req, "hour") {
            None => None,
            Some(h) => {
                let (start, end) = h
                    .split_once('+')
                    .ok_or_else(|| bad_req("hour expects start+end"))?;
                let start = start.parse().map_err(|_| bad_req("unparseable hour"))?;
                let end = end.parse().map_err(|_| bad_req("unparseable hour"))?;
                Some((start, end))
            }
        };
        let cams = raw_query_param(req, "cam")
            .map(|c| parse_cam_tokens(&c))
            .unwrap_or_default();

        let f = self.dvr.store.bundle(year, month, day, hours, &cams)?;
        let mut hdrs = header::HeaderMap::new();
        hdrs.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/zip"),
        );
        hdrs.insert(
            header::CONTENT_DISPOSITION,
            HeaderValue::try_from(format!(
                "attachment; filename=\"{}-{:02}-{:02}.zip\"",
                year, month, day
            ))
            .expect("header value from formatted date"),
        );
        let e: http_serve::ChunkedReadFile<Chunk, BoxedError> =
            http_serve::ChunkedReadFile::new(f, hdrs)
                .map_err(|e| internal_server_err(failure::err_msg(e)))?;
        Ok(http_serve::serve(e, req))
    }

    /// Legacy push-registration. Peers retry periodically, so an incomplete
    /// request is dropped without comment rather than answered with an error.
    fn declare(&self, req: &Request<::hyper::Body>) -> ResponseResult {
        let name = raw_query_param(req, "name");
        let url = raw_query_param(req, "url");
        let available = raw_query_param(req, "available");
        let devices = raw_query_param(req, "devices");
        if let (Some(name), Some(url), Some(available), Some(devices)) =
            (name, url, available, devices)
        {
            let admin = raw_query_param(req, "admin").unwrap_or_else(|| url.clone());
            let now = self.clocks.realtime().sec;
            self.dvr
                .feeds
                .lock()
                .declare(&name, &admin, &url, &available, &devices, now);
        }
        Ok(plain_response(StatusCode::OK, ""))
    }

    async fn video(&self, req: Request<hyper::Body>) -> ResponseResult {
        let dir = self
            .archive_dir
            .clone()
            .ok_or_else(|| not_found("archive is not readable"))?;
        let rel = req
            .uri()
            .path()
            .strip_prefix("/dvr/storage/videos/")
            .expect("Path::Video implies the prefix")
            .to_owned();
        if rel.split('/').any(|seg| seg == "..") {
            return Err(bad_req("path traversal"));
        }
        let mime = match rel.rsplit_once('.').map(|(_, e)| e) {
            Some("mkv") => "video/x-matroska",
            Some("mp4") => "video/mp4",
            Some("avi") => "video/x-msvideo",
            Some("jpg") => "image/jpeg",
            _ => "application/octet-stream",
        };
        let f = dir.get(&rel, req.headers());
        let node = f.await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                not_found("no such recording")
            } else {
                internal_server_err(failure::err_msg(e))
            }
        })?;
        let mut hdrs = http::HeaderMap::new();
        node.add_encoding_headers(&mut hdrs);
        hdrs.insert(header::CONTENT_TYPE, HeaderValue::from_static(mime));
        let e = node
            .into_file_entity(hdrs)
            .map_err(|e| internal_server_err(failure::err_msg(e)))?;
        Ok(http_serve::serve(e, &req))
    }

    async fn static_file(&self, req: Request<hyper::Body>) -> ResponseResult {
        let dir = self
            .ui_dir
            .clone()
            .ok_or_else(|| not_found("--ui-dir not configured; no static files available."))?;
        let static_req = match StaticFileRequest::parse(req.uri().path()) {
            None => return Err(not_found("static file not found")),
            Some(r) => r,
        };
        let f = dir.get(static_req.path, req.headers());
        let node = f.await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                not_found("no such static file")
            } else {
                internal_server_err(failure::err_msg(e))
            }
        })?;
        let mut hdrs = http::HeaderMap::new();
        node.add_encoding_headers(&mut hdrs);
        hdrs.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(static_req.mime),
        );
        let e = node
            .into_file_entity(hdrs)
            .map_err(|e| internal_server_err(failure::err_msg(e)))?;
        Ok(http_serve::serve(e, &req))
    }
}

#[derive(Debug, Eq, PartialEq)]
struct StaticFileRequest<'a> {
    path: &'a str,
    mime: &'static str,
}

impl<'a> StaticFileRequest<'a> {
    fn parse(path: &'a str) -> Option<Self> {
        if !path.starts_with('/') || path.contains("..") {
            return None;
        }
        let path = match &path[1..] {
            "" => "index.html",
            p => p,
        };
        let ext = path.rsplit_once('.')?.1;
        let mime = match ext {
            "css" => "text/css",
            "html" => "text/html",
            "ico" => "image/x-icon",
            "js" | "map" => "text/javascript",
            "json" => "application/json",
            "png" => "image/png",
            "svg" => "image/svg+xml",
            "txt" => "text/plain",
            "woff2" => "font/woff2",
            _ => return None,
        };
        Some(StaticFileRequest { path, mime })
    }
}
