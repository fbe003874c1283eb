/*
 * Copyright 2023 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *       http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Admission webhooks defaulting and validating game servers and sets as
//! they are submitted, and fixing up passthrough pods.

use std::{convert::Infallible, net::SocketAddr};

use hyper::{
    header,
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use k8s_openapi::api::core::v1::Pod;
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
    response::StatusDetails,
    DynamicObject,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    apis::{pod::apply_passthrough_ports, Cause, GameServer, GameServerSet, GROUP},
    signal::ShutdownRx,
};

#[derive(Clone, Copy, Debug, Default)]
pub struct WebhookConfig {
    /// Whether pods get their passthrough container ports rewritten.
    pub passthrough_port_policy: bool,
}

fn object<K: DeserializeOwned>(object: Option<&DynamicObject>) -> crate::Result<K> {
    let object = object.ok_or_else(|| eyre::eyre!("admission request has no object"))?;
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// Allows the request, patching the object from `original` to `mutated`.
fn patch<K: Serialize>(
    request: &AdmissionRequest<DynamicObject>,
    original: &K,
    mutated: &K,
) -> crate::Result<AdmissionResponse> {
    let patch = json_patch::diff(&serde_json::to_value(original)?, &serde_json::to_value(mutated)?);
    Ok(AdmissionResponse::from(request).with_patch(patch)?)
}

fn deny(
    request: &AdmissionRequest<DynamicObject>,
    kind: &str,
    name: &str,
    causes: Vec<Cause>,
) -> AdmissionResponse {
    tracing::debug!(%kind, %name, ?causes, "denying invalid object");
    let mut response = AdmissionResponse::from(request).deny(format!("{kind} configuration is invalid"));
    response.result.reason = "Invalid".into();
    response.result.code = 422;
    response.result.details = Some(StatusDetails {
        name: name.into(),
        group: GROUP.into(),
        kind: kind.into(),
        uid: String::new(),
        causes: causes.into_iter().map(Into::into).collect(),
        retry_after_seconds: 0,
    });
    response
}

fn mutate_game_server(request: &AdmissionRequest<DynamicObject>) -> crate::Result<AdmissionResponse> {
    let original: GameServer = object(request.object.as_ref())?;
    let mut gs = original.clone();
    gs.apply_defaults();
    patch(request, &original, &gs)
}

fn validate_game_server(request: &AdmissionRequest<DynamicObject>) -> crate::Result<AdmissionResponse> {
    let mut gs: GameServer = object(request.object.as_ref())?;
    // Mutation may not have run yet.
    gs.apply_defaults();

    let causes = gs.validate();
    if causes.is_empty() {
        Ok(AdmissionResponse::from(request))
    } else {
        let name = gs.metadata.generate_name.as_deref().unwrap_or(gs.name()).to_owned();
        Ok(deny(request, "GameServer", &name, causes))
    }
}

fn validate_game_server_set(
    request: &AdmissionRequest<DynamicObject>,
) -> crate::Result<AdmissionResponse> {
    let gss: GameServerSet = object(request.object.as_ref())?;
    let causes = match request.operation {
        Operation::Update => gss.validate_update(&object(request.old_object.as_ref())?),
        _ => gss.validate(),
    };

    if causes.is_empty() {
        Ok(AdmissionResponse::from(request))
    } else {
        Ok(deny(request, "GameServerSet", gss.name(), causes))
    }
}

fn mutate_pod(request: &AdmissionRequest<DynamicObject>) -> crate::Result<AdmissionResponse> {
    let original: Pod = object(request.object.as_ref())?;
    let mut pod = original.clone();
    if !apply_passthrough_ports(&mut pod)? {
        return Ok(AdmissionResponse::from(request));
    }
    patch(request, &original, &pod)
}

/// Answers a single admission request sent to `path`.
#[tracing::instrument(skip_all, fields(path = %path, kind = %request.kind.kind, uid = %request.uid))]
pub fn review(
    config: WebhookConfig,
    path: &str,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let kind = request.kind.kind.as_str();
    let result = match (path, kind, &request.operation) {
        ("/mutate", "GameServer", Operation::Create) => mutate_game_server(request),
        ("/validate", "GameServer", Operation::Create) => validate_game_server(request),
        ("/validate", "GameServerSet", Operation::Create | Operation::Update) => {
            validate_game_server_set(request)
        }
        ("/mutate", "Pod", Operation::Create) if config.passthrough_port_policy => {
            mutate_pod(request)
        }
        _ => {
            tracing::trace!("no admission handler, allowing");
            Ok(AdmissionResponse::from(request))
        }
    };

    result.unwrap_or_else(|error| {
        tracing::warn!(%error, "admission request failed");
        AdmissionResponse::from(request).deny(error.to_string())
    })
}

async fn handle_request(config: WebhookConfig, request: Request<Body>) -> crate::Result<Response<Body>> {
    let path = request.uri().path().to_owned();
    if request.method() != Method::POST || !matches!(path.as_str(), "/mutate" | "/validate") {
        let mut response = Response::new(Body::from("not found"));
        *response.status_mut() = StatusCode::NOT_FOUND;
        return Ok(response);
    }

    let body = hyper::body::to_bytes(request.into_body()).await?;
    let admission: AdmissionReview<DynamicObject> = serde_json::from_slice(&body)?;
    let request: Result<AdmissionRequest<DynamicObject>, _> = admission.try_into();
    let response = match request {
        Ok(request) => review(config, &path, &request),
        Err(error) => {
            tracing::warn!(%error, "invalid admission review");
            AdmissionResponse::invalid(error.to_string())
        }
    };

    let mut response = Response::new(Body::from(serde_json::to_vec(&response.into_review())?));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

/// Serves `/mutate` and `/validate` on `address` until `shutdown` fires.
pub async fn serve(
    address: SocketAddr,
    config: WebhookConfig,
    mut shutdown: ShutdownRx,
) -> crate::Result<()> {
    tracing::info!(%address, ?config, "serving admission webhooks");

    let make_svc = make_service_fn(move |_conn| async move {
        Ok::<_, Infallible>(service_fn(move |request| async move {
            let response = handle_request(config, request).await.unwrap_or_else(|error| {
                tracing::warn!(%error, "webhook http server error");
                let mut response = Response::new(Body::from(error.to_string()));
                *response.status_mut() = StatusCode::BAD_REQUEST;
                response
            });
            Ok::<_, Infallible>(response)
        }))
    });

    Server::try_bind(&address)?
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}
