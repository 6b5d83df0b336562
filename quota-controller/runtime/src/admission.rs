use crate::{
    core::{ClaimRequest, ClusterAccessor, Decided, Decision, Engine},
    k8s::{
        requested_bytes, storage_class_name, PersistentVolumeClaim, PersistentVolumeClaimSpec,
        Resource,
    },
    metrics::AdmissionMetrics,
};
use anyhow::{anyhow, Result};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::{admission::Operation, DynamicObject};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

const VALIDATE_PATH: &str = "/validate";

pub struct Admission<A> {
    engine: Arc<Engine<A>>,
    metrics: AdmissionMetrics,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[source] BoxError),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl<A, B> tower::Service<Request<B>> for Admission<A>
where
    A: ClusterAccessor + Send + Sync + 'static,
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        if req.method() != http::Method::POST || req.uri().path() != VALIDATE_PATH {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            let content_type = req
                .headers()
                .get(http::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let bytes = req
                .into_body()
                .collect()
                .await
                .map_err(|e| Error::Request(e.into()))?
                .to_bytes();

            if bytes.is_empty() {
                warn!("Empty request body");
                return Ok(text_response(http::StatusCode::BAD_REQUEST, "empty body"));
            }

            if !is_json(&content_type) {
                warn!(%content_type, "Unsupported content type");
                return Ok(text_response(
                    http::StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    format!("Content-Type={content_type}, expect `application/json`"),
                ));
            }

            let review: AdmissionReview = match serde_json::from_slice(&bytes) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(req).await
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl<A> Clone for Admission<A> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<A: ClusterAccessor + Send + Sync> Admission<A> {
    pub fn new(engine: Arc<Engine<A>>, metrics: AdmissionMetrics) -> Self {
        Self { engine, metrics }
    }

    async fn admit(&self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);
        let ns = req.namespace.clone().unwrap_or_default();
        let name = req.name.clone();

        if !is_kind::<PersistentVolumeClaim>(&req) {
            let decision = Decision::NoOpinion(format!(
                "unsupported resource type: {}.{}.{}",
                req.kind.group, req.kind.version, req.kind.kind
            ));
            self.metrics.decided("other", &decision, 0);
            return respond(rsp, decision);
        }

        let claim = match parse_claim(&req) {
            Ok(Some(claim)) => claim,
            Ok(None) => {
                debug!(%ns, %name, "Claim is not subject to a storage quota");
                return rsp;
            }
            Err(error) => {
                info!(%error, %ns, %name, "Failed to parse PersistentVolumeClaim");
                return rsp.deny(error);
            }
        };

        let operation = claim.operation.as_str();
        match self.engine.decide(&claim).await {
            Ok(Decided {
                decision,
                conflicts,
            }) => {
                self.metrics.decided(operation, &decision, conflicts);
                if let Decision::Deny(reason) = &decision {
                    info!(%ns, %name, class = %claim.storage_class, %operation, %reason, "Denied");
                }
                respond(rsp, decision)
            }
            Err(error) => {
                warn!(%error, %ns, %name, class = %claim.storage_class, %operation, "Failed to evaluate storage quota");
                self.metrics.failed(operation);
                rsp.deny(error)
            }
        }
    }
}

fn respond(rsp: AdmissionResponse, decision: Decision) -> AdmissionResponse {
    match decision {
        Decision::Allow => rsp,
        Decision::Deny(reason) | Decision::NoOpinion(reason) => rsp.deny(reason),
    }
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn is_json(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    essence.eq_ignore_ascii_case("application/json")
}

/// Extracts the claim under review. Returns `None` for claims that do not
/// name a storage class and for operations that do not change capacity.
fn parse_claim(req: &AdmissionRequest) -> Result<Option<ClaimRequest>> {
    match req.operation {
        Operation::Create => {
            let spec = parse_spec(req.object.as_ref(), "object")?;
            let Some(class) = storage_class_name(&spec) else {
                return Ok(None);
            };
            Ok(Some(ClaimRequest::create(class, requested_bytes(&spec)?)))
        }

        Operation::Update => {
            // The class of a bound claim is immutable, so the old object's
            // class is authoritative.
            let old = parse_spec(req.old_object.as_ref(), "oldObject")?;
            let new = parse_spec(req.object.as_ref(), "object")?;
            let Some(class) = storage_class_name(&old) else {
                return Ok(None);
            };
            Ok(Some(ClaimRequest::update(
                class,
                requested_bytes(&old)?,
                requested_bytes(&new)?,
            )))
        }

        Operation::Delete => {
            let spec = parse_spec(req.old_object.as_ref(), "oldObject")?;
            let Some(class) = storage_class_name(&spec) else {
                return Ok(None);
            };
            Ok(Some(ClaimRequest::delete(class, requested_bytes(&spec)?)))
        }

        Operation::Connect => Ok(None),
    }
}

fn parse_spec(obj: Option<&DynamicObject>, field: &str) -> Result<PersistentVolumeClaimSpec> {
    let obj = obj.ok_or_else(|| anyhow!("admission request missing '{field}'"))?;
    let data = obj
        .data
        .get("spec")
        .cloned()
        .ok_or_else(|| anyhow!("admission request missing '{field}.spec'"))?;
    Ok(serde_json::from_value(data)?)
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

fn text_response(status: http::StatusCode, msg: impl Into<String>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(msg.into()))
        .expect("error response must be valid")
}
