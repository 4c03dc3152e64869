// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// IPP-over-HTTP client used by the proxy agent to talk to its
// infrastructure printer: a thin hyper client sending `POST` bodies built
// by hand, since the operations this agent issues (`Acknowledge-Job`,
// `Fetch-Job`, `Update-Job-Status`, ...) sit outside the small set of
// standard operations a generic IPP client builder knows how to construct.

use std::sync::atomic::{AtomicU32, Ordering};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyDataStream, Full};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::rt::TokioExecutor;
use inftprint_core::error::{InftError, Result};
use ipp::attribute::IppAttribute;
use ipp::model::{DelimiterTag, IppVersion, Operation};
use ipp::parser::AsyncIppParser;
use ipp::request::IppRequestResponse;
use ipp::value::IppValue;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tokio_util::io::StreamReader;
use tracing::{debug, instrument};

const IPP_CONTENT_TYPE: &str = "application/ipp";
const VERSION: IppVersion = IppVersion::v2_0();

/// A connection to a single infrastructure printer. Holds the target
/// resource URI and an optional pre-encoded `Authorization` header value;
/// every call reuses the same underlying HTTP connector.
pub struct ProxyClient {
    uri: Uri,
    authorization: Option<String>,
    http: LegacyClient<HttpConnector, Full<Bytes>>,
    next_request_id: AtomicU32,
}

impl ProxyClient {
    pub fn new(uri: Uri, username: Option<&str>, password: Option<&str>) -> Self {
        let authorization = username.map(|user| {
            let credentials = format!("{user}:{}", password.unwrap_or_default());
            format!("Basic {}", BASE64.encode(credentials))
        });
        Self {
            uri,
            authorization,
            http: LegacyClient::builder(TokioExecutor::new()).build_http(),
            next_request_id: AtomicU32::new(1),
        }
    }

    pub fn printer_uri_string(&self) -> String {
        self.uri.to_string()
    }

    fn request_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn new_request(&self, operation: Operation) -> IppRequestResponse {
        let mut req = IppRequestResponse::new(VERSION, operation, self.request_id());
        req.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new("printer-uri", IppValue::Uri(self.printer_uri_string())),
        );
        req.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new(IppAttribute::ATTRIBUTES_CHARSET, IppValue::Charset("utf-8".to_string())),
        );
        req.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new(IppAttribute::ATTRIBUTES_NATURAL_LANGUAGE, IppValue::NaturalLanguage("en".to_string())),
        );
        req
    }

    fn add_op_attr(req: &mut IppRequestResponse, name: &str, value: IppValue) {
        req.attributes_mut().add(DelimiterTag::OperationAttributes, IppAttribute::new(name, value));
    }

    /// Send a request and parse the response. A non-successful IPP status
    /// is not treated as a transport error here — callers inspect
    /// `response.header().operation_or_status` themselves, since several
    /// call sites (e.g. `Get-Notifications` racing a lease expiry) need to
    /// branch on specific status codes rather than a bare pass/fail.
    #[instrument(skip(self, req))]
    async fn send(&self, req: IppRequestResponse) -> Result<IppRequestResponse> {
        let body = Bytes::from(req.to_bytes().to_vec());
        let mut builder = Request::builder().method("POST").uri(self.uri.clone()).header(CONTENT_TYPE, IPP_CONTENT_TYPE);
        if let Some(auth) = &self.authorization {
            builder = builder.header(AUTHORIZATION, auth.clone());
        }
        let http_req = builder.body(Full::new(body)).map_err(|e| InftError::ProxyConnection(e.to_string()))?;

        let resp = self.http.request(http_req).await.map_err(|e| InftError::ProxyConnection(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(InftError::ProxyConnection(format!("HTTP {status}")));
        }

        let stream = BodyDataStream::new(resp.into_body());
        let reader = StreamReader::new(stream).compat();
        let parsed = AsyncIppParser::new(reader).parse().await.map_err(|e| InftError::ProxyConnection(e.to_string()))?;
        debug!(status = parsed.header().operation_or_status, "received response");
        Ok(parsed)
    }

    /// `Create-Printer-Subscriptions` with a single pull-mode subscription
    /// covering job-fetchable/job-state-changed/printer-state-changed
    /// events. Returns the assigned `notify-subscription-id`.
    pub async fn subscribe(&self) -> Result<i32> {
        let mut req = self.new_request(Operation::CreatePrinterSubscriptions);
        req.attributes_mut().add(
            DelimiterTag::SubscriptionAttributes,
            IppAttribute::new("notify-pull-method", IppValue::Keyword("ippget".to_string())),
        );
        req.attributes_mut().add(
            DelimiterTag::SubscriptionAttributes,
            IppAttribute::new(
                "notify-events",
                IppValue::Array(vec![
                    IppValue::Keyword("job-fetchable".to_string()),
                    IppValue::Keyword("job-state-changed".to_string()),
                    IppValue::Keyword("printer-state-changed".to_string()),
                ]),
            ),
        );
        let resp = self.send(req).await?;
        extract_int(&resp, DelimiterTag::SubscriptionAttributes, "notify-subscription-id")
            .ok_or_else(|| InftError::ProxyConnection("registration did not return a subscription id".into()))
    }

    /// `Cancel-Subscription`, issued once on clean shutdown.
    pub async fn deregister(&self, subscription_id: i32) -> Result<()> {
        let mut req = self.new_request(Operation::CancelSubscription);
        Self::add_op_attr(&mut req, "notify-subscription-id", IppValue::Integer(subscription_id));
        self.send(req).await?;
        Ok(())
    }

    /// `Get-Notifications`, long-polling up to the server's 30s bound.
    /// `since` is the lowest sequence number not yet delivered.
    pub async fn get_notifications(&self, subscription_id: i32, since: i32) -> Result<Vec<Notification>> {
        let mut req = self.new_request(Operation::GetNotifications);
        Self::add_op_attr(&mut req, "notify-subscription-ids", IppValue::Integer(subscription_id));
        Self::add_op_attr(&mut req, "notify-sequence-numbers", IppValue::Integer(since));
        Self::add_op_attr(&mut req, "notify-wait", IppValue::Boolean(true));
        let resp = self.send(req).await?;
        Ok(parse_notifications(&resp))
    }

    /// `Acknowledge-Job` followed by `Fetch-Job`, returning the job's
    /// `document-format` for use in the subsequent `Fetch-Document` call.
    pub async fn acknowledge_and_fetch_job(&self, job_id: i32, device_uuid: &str) -> Result<FetchedJob> {
        let mut ack = self.new_request(Operation::AcknowledgeJob);
        Self::add_op_attr(&mut ack, "job-id", IppValue::Integer(job_id));
        Self::add_op_attr(&mut ack, "output-device-uuid", IppValue::Uri(device_uuid.to_string()));
        self.send(ack).await?;

        let mut fetch = self.new_request(Operation::FetchJob);
        Self::add_op_attr(&mut fetch, "job-id", IppValue::Integer(job_id));
        let resp = self.send(fetch).await?;
        let format = extract_text(&resp, DelimiterTag::JobAttributes, "document-format").unwrap_or_else(|| "application/octet-stream".to_string());
        Ok(FetchedJob { job_id, format })
    }

    /// `Fetch-Document`: returns the spooled document's bytes. The caller
    /// negotiates no format conversion — this service has no transform
    /// path of its own, so the proxy accepts whatever format the job was
    /// submitted in.
    pub async fn fetch_document(&self, job_id: i32) -> Result<Vec<u8>> {
        let mut req = self.new_request(Operation::FetchDocument);
        Self::add_op_attr(&mut req, "job-id", IppValue::Integer(job_id));
        let resp = self.send(req).await?;
        let mut payload = resp.into_payload();
        let mut bytes = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut payload, &mut bytes).await?;
        Ok(bytes)
    }

    /// `Acknowledge-Document`, confirming the fetched bytes were received.
    pub async fn acknowledge_document(&self, job_id: i32) -> Result<()> {
        let mut req = self.new_request(Operation::AcknowledgeDocument);
        Self::add_op_attr(&mut req, "job-id", IppValue::Integer(job_id));
        self.send(req).await?;
        Ok(())
    }

    /// `Update-Job-Status`: reports impressions completed and, when the
    /// local command has finished, `output-device-job-state = 9`
    /// (completed).
    pub async fn update_job_status(&self, job_id: i32, impressions_completed: i32, completed: bool) -> Result<()> {
        let mut req = self.new_request(Operation::UpdateJobStatus);
        Self::add_op_attr(&mut req, "job-id", IppValue::Integer(job_id));
        Self::add_op_attr(&mut req, "impressions-completed", IppValue::Integer(impressions_completed));
        if completed {
            Self::add_op_attr(&mut req, "output-device-job-state", IppValue::Integer(9));
        }
        self.send(req).await?;
        Ok(())
    }

    /// `Update-Output-Device-Attributes`: the registration call that
    /// assigns this proxy's `output-device-uuid` and advertises its
    /// state/state-reasons to the infrastructure printer.
    pub async fn update_output_device_attributes(&self, device_uuid: &str, device_name: &str) -> Result<()> {
        let mut req = self.new_request(Operation::UpdateOutputDeviceAttributes);
        Self::add_op_attr(&mut req, "output-device-uuid", IppValue::Uri(device_uuid.to_string()));
        Self::add_op_attr(&mut req, "output-device-name", IppValue::NameWithoutLanguage(device_name.to_string()));
        Self::add_op_attr(&mut req, "output-device-state", IppValue::Enum(3));
        self.send(req).await?;
        Ok(())
    }
}

pub struct FetchedJob {
    pub job_id: i32,
    pub format: String,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub subscription_id: i32,
    pub sequence: i32,
    pub event: String,
    pub job_id: Option<i32>,
}

fn extract_int(resp: &IppRequestResponse, tag: DelimiterTag, name: &str) -> Option<i32> {
    resp.attributes().groups_of(tag).find_map(|g| match g.attributes().get(name)?.value() {
        IppValue::Integer(v) => Some(*v),
        _ => None,
    })
}

fn extract_text(resp: &IppRequestResponse, tag: DelimiterTag, name: &str) -> Option<String> {
    resp.attributes().groups_of(tag).find_map(|g| {
        let attr = g.attributes().get(name)?;
        Some(format!("{}", attr.value()))
    })
}

fn parse_notifications(resp: &IppRequestResponse) -> Vec<Notification> {
    let mut out = Vec::new();
    for group in resp.attributes().groups_of(DelimiterTag::EventNotificationAttributes) {
        let attrs = group.attributes();
        let Some(IppValue::Integer(subscription_id)) = attrs.get("notify-subscription-id").map(|a| a.value().clone()) else {
            continue;
        };
        let sequence = match attrs.get("notify-sequence-number").map(|a| a.value()) {
            Some(IppValue::Integer(n)) => *n,
            _ => 0,
        };
        let event = attrs.get("notify-subscribed-event").map(|a| format!("{}", a.value())).unwrap_or_default();
        let job_id = match attrs.get("notify-job-id").map(|a| a.value()) {
            Some(IppValue::Integer(n)) => Some(*n),
            _ => None,
        };
        out.push(Notification { subscription_id, sequence, event, job_id });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_without_credentials_sets_no_authorization_header() {
        let client = ProxyClient::new(Uri::from_static("http://localhost:631/ipp/system"), None, None);
        assert!(client.authorization.is_none());
    }

    #[test]
    fn client_with_credentials_base64_encodes_basic_auth() {
        let client = ProxyClient::new(Uri::from_static("http://localhost:631/ipp/system"), Some("alice"), Some("secret"));
        assert_eq!(client.authorization.as_deref(), Some("Basic YWxpY2U6c2VjcmV0"));
    }

    #[test]
    fn request_ids_are_assigned_once_each() {
        let client = ProxyClient::new(Uri::from_static("http://localhost:631/ipp/system"), None, None);
        let a = client.request_id();
        let b = client.request_id();
        assert_ne!(a, b);
    }
}
