// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// HTTP/1.1 framing for the IPP wire protocol: a bare `POST` of an
// `application/ipp` body per resource path, with HTTP Basic authentication
// resolved into an `Identity` before the request reaches the dispatcher.

use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::{BodyDataStream, BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use inftprint_security::{parse_basic_auth, resolve_identity, Identity};
use ipp::parser::AsyncIppParser;
use ipp::request::IppRequestResponse;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tokio_util::io::StreamReader;
use tracing::{error, info, instrument, warn};

use crate::dispatcher::{self, Context};

const IPP_CONTENT_TYPE: &str = "application/ipp";

/// Bind `addr` and serve IPP-over-HTTP connections until the process is
/// asked to stop. Each accepted connection is handled on its own task; a
/// connection error is logged and does not bring down the listener.
pub async fn serve(addr: SocketAddr, ctx: Context) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "infrprintd listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let ctx = ctx.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let ctx = ctx.clone();
                async move { Ok::<_, std::convert::Infallible>(handle(req, ctx).await) }
            });
            if let Err(err) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new()).serve_connection(io, service).await {
                warn!(%peer, error = %err, "connection error");
            }
        });
    }
}

/// Extract an `Identity` from the request's `Authorization: Basic` header,
/// resolving the decoded username's group memberships from the OS. A
/// missing or malformed header yields `None` (anonymous); a bad password is
/// not distinguishable from a bad username at this layer — this service
/// trusts whatever identity claims a caller on the loopback/trusted network
/// presents, the same way the dispatcher's group checks are the real gate.
fn identity_from_request<B>(req: &Request<B>) -> Option<Identity> {
    let header = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let (username, _password) = parse_basic_auth(header)?;
    Some(resolve_identity(&username))
}

fn is_ipp_content_type<B>(req: &Request<B>) -> bool {
    req.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()).is_some_and(|v| v.starts_with(IPP_CONTENT_TYPE))
}

fn plain_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder().status(status).body(Full::new(Bytes::new())).expect("static response is well-formed")
}

/// Read the inbound body and parse it as an IPP message, bridging hyper's
/// `Incoming` body into the `futures::io::AsyncRead` the parser expects via
/// `StreamReader` (tokio-util) followed by a tokio-to-futures `.compat()`.
async fn parse_request(body: Incoming) -> Result<IppRequestResponse, std::io::Error> {
    let stream = BodyDataStream::new(body);
    let reader = StreamReader::new(stream).compat();
    AsyncIppParser::new(reader).parse().await.map_err(|e| std::io::Error::other(e.to_string()))
}

/// Serialize a response's attribute groups and payload (if any) into a
/// single buffer. Responses from this service are job/printer/system
/// metadata or a spooled document of modest size, so buffering in full
/// avoids a hand-rolled streaming `http_body::Body` implementation.
async fn serialize_response(resp: IppRequestResponse) -> std::io::Result<Bytes> {
    let mut bytes = resp.to_bytes().to_vec();
    let mut payload = resp.into_payload();
    payload.read_to_end(&mut bytes).await?;
    Ok(Bytes::from(bytes))
}

#[instrument(skip(req, ctx))]
async fn handle(req: Request<Incoming>, ctx: Context) -> Response<Full<Bytes>> {
    if req.method() != Method::POST {
        return plain_response(StatusCode::METHOD_NOT_ALLOWED);
    }
    if !is_ipp_content_type(&req) {
        return plain_response(StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    let identity = identity_from_request(&req);
    let (_parts, body) = req.into_parts();
    let parsed = match parse_request(body).await {
        Ok(req) => req,
        Err(err) => {
            warn!(error = %err, "failed to parse IPP request body");
            return plain_response(StatusCode::BAD_REQUEST);
        }
    };

    let version = parsed.header().version;
    let request_id = parsed.header().request_id;
    match dispatcher::dispatch_result(&ctx, parsed, identity).await {
        Ok(resp) => ipp_response(resp).await,
        Err(inftprint_core::error::InftError::AuthenticationRequired) => plain_response(StatusCode::UNAUTHORIZED),
        Err(inftprint_core::error::InftError::Forbidden(reason)) => {
            warn!(%reason, "forbidden");
            plain_response(StatusCode::FORBIDDEN)
        }
        Err(err) => ipp_response(dispatcher::error_response(version, request_id, err)).await,
    }
}

async fn ipp_response(resp: IppRequestResponse) -> Response<Full<Bytes>> {
    match serialize_response(resp).await {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, IPP_CONTENT_TYPE)
            .body(Full::new(bytes))
            .expect("well-formed IPP response"),
        Err(err) => {
            error!(error = %err, "failed to serialize IPP response");
            plain_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_from_request_parses_basic_auth_header() {
        let req = Request::builder().header(AUTHORIZATION, "Basic YWxpY2U6c2VjcmV0").body(()).unwrap();
        let identity = identity_from_request(&req).expect("identity");
        assert_eq!(identity.username, "alice");
    }

    #[test]
    fn identity_from_request_is_none_without_header() {
        let req = Request::builder().body(()).unwrap();
        assert!(identity_from_request(&req).is_none());
    }

    #[test]
    fn is_ipp_content_type_accepts_exact_and_rejects_other() {
        let ipp = Request::builder().header(CONTENT_TYPE, "application/ipp").body(()).unwrap();
        assert!(is_ipp_content_type(&ipp));
        let json = Request::builder().header(CONTENT_TYPE, "application/json").body(()).unwrap();
        assert!(!is_ipp_content_type(&json));
    }
}
