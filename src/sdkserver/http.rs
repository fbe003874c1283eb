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

//! The HTTP side of the SDK server: the health endpoints probed by the
//! kubelet, and a JSON gateway in front of the gRPC service for game
//! servers without a gRPC client.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use futures::StreamExt;
use hyper::{
    header,
    server::conn::AddrIncoming,
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tonic::{transport::Channel, Code, Status};

use crate::{
    generated::agones::dev::sdk::{self, sdk_client::SdkClient, Empty, KeyValue},
    signal::ShutdownRx,
};

/// Reports whether the game server is healthy.
pub type HealthCheck = Arc<dyn Fn() -> bool + Send + Sync>;

fn text_response(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}

fn json_response(status: StatusCode, body: &Value) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

/// `/healthz` answers as long as the SDK server is up, `/gshealthz` only
/// while the game server is healthy.
pub fn health_response(request: &Request<Body>, healthy: &(dyn Fn() -> bool + Send + Sync)) -> Response<Body> {
    match (request.method(), request.uri().path()) {
        (&Method::GET, "/healthz") => text_response(StatusCode::OK, "ok"),
        (&Method::GET, "/gshealthz") if healthy() => text_response(StatusCode::OK, "ok"),
        (&Method::GET, "/gshealthz") => {
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "unhealthy")
        }
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    }
}

pub async fn serve_health(
    listener: tokio::net::TcpListener,
    healthy: HealthCheck,
    mut shutdown: ShutdownRx,
) -> crate::Result<()> {
    tracing::info!(address = %listener.local_addr()?, "serving sdk health checks");

    let make_svc = make_service_fn(move |_conn| {
        let healthy = healthy.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                let response = health_response(&request, &*healthy);
                async move { Ok::<_, Infallible>(response) }
            }))
        }
    });

    Server::builder(AddrIncoming::from_listener(listener)?)
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

/// Serves the JSON gateway on `listener`, forwarding every call to the gRPC
/// service listening on `grpc_address`.
pub async fn serve_gateway(
    listener: tokio::net::TcpListener,
    grpc_address: SocketAddr,
    mut shutdown: ShutdownRx,
) -> crate::Result<()> {
    let client = SdkClient::new(
        tonic::transport::Endpoint::from_shared(format!("http://{grpc_address}"))?.connect_lazy(),
    );
    tracing::info!(address = %listener.local_addr()?, %grpc_address, "serving sdk http gateway");

    let make_svc = make_service_fn(move |_conn| {
        let client = client.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                let client = client.clone();
                async move { Ok::<_, Infallible>(gateway(request, client).await) }
            }))
        }
    });

    Server::builder(AddrIncoming::from_listener(listener)?)
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::InvalidArgument | Code::OutOfRange | Code::FailedPrecondition => {
            StatusCode::BAD_REQUEST
        }
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn status_json(status: &Status) -> Value {
    json!({
        "code": status.code() as i32,
        "message": status.message(),
    })
}

fn empty_response() -> Response<Body> {
    json_response(StatusCode::OK, &json!({}))
}

async fn read_json<T: DeserializeOwned>(request: Request<Body>) -> Result<T, Status> {
    let body = hyper::body::to_bytes(request.into_body())
        .await
        .map_err(|error| Status::invalid_argument(error.to_string()))?;
    let body: &[u8] = if body.is_empty() { b"{}" } else { &body };
    serde_json::from_slice(body).map_err(|error| Status::invalid_argument(error.to_string()))
}

/// Durations are `{"seconds": "10"}`, with the number either quoted or not.
fn reserve_seconds(body: &Value) -> Result<i64, Status> {
    let invalid = || Status::invalid_argument(format!("invalid seconds in {body}"));
    match body.get("seconds") {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(seconds)) => seconds.as_i64().ok_or_else(invalid),
        Some(Value::String(seconds)) => seconds.parse().map_err(|_| invalid()),
        Some(_) => Err(invalid()),
    }
}

#[derive(serde::Deserialize)]
struct KeyValueBody {
    key: String,
    value: String,
}

impl From<KeyValueBody> for KeyValue {
    fn from(body: KeyValueBody) -> Self {
        Self {
            key: body.key,
            value: body.value,
        }
    }
}

/// The JSON form of `gs`, using the field names of the protobuf messages.
/// 64 bit integers are strings.
pub fn game_server_json(gs: &sdk::GameServer) -> Value {
    let meta = gs.object_meta.clone().unwrap_or_default();
    let health = gs
        .spec
        .as_ref()
        .and_then(|spec| spec.health.clone())
        .unwrap_or_default();
    let status = gs.status.clone().unwrap_or_default();

    json!({
        "object_meta": {
            "name": meta.name,
            "namespace": meta.namespace,
            "uid": meta.uid,
            "resource_version": meta.resource_version,
            "generation": meta.generation.to_string(),
            "creation_timestamp": meta.creation_timestamp.to_string(),
            "deletion_timestamp": meta.deletion_timestamp.to_string(),
            "annotations": meta.annotations,
            "labels": meta.labels,
        },
        "spec": {
            "health": {
                "disabled": health.disabled,
                "period_seconds": health.period_seconds,
                "failure_threshold": health.failure_threshold,
                "initial_delay_seconds": health.initial_delay_seconds,
            },
        },
        "status": {
            "state": status.state,
            "address": status.address,
            "addresses": status
                .addresses
                .iter()
                .map(|address| json!({ "type": address.r#type, "address": address.address }))
                .collect::<Vec<_>>(),
            "ports": status
                .ports
                .iter()
                .map(|port| json!({ "name": port.name, "port": port.port }))
                .collect::<Vec<_>>(),
            "counters": status
                .counters
                .iter()
                .map(|(name, counter)| {
                    (
                        name.clone(),
                        json!({
                            "count": counter.count.to_string(),
                            "capacity": counter.capacity.to_string(),
                        }),
                    )
                })
                .collect::<serde_json::Map<_, _>>(),
            "lists": status
                .lists
                .iter()
                .map(|(name, list)| {
                    (
                        name.clone(),
                        json!({
                            "capacity": list.capacity.to_string(),
                            "values": list.values,
                        }),
                    )
                })
                .collect::<serde_json::Map<_, _>>(),
        },
    })
}

/// Streams every snapshot as a line of JSON, `{"result": <game server>}`.
fn watch_response(stream: tonic::Streaming<sdk::GameServer>) -> Response<Body> {
    let lines = stream.map(|item| {
        let line = match item {
            Ok(gs) => json!({ "result": game_server_json(&gs) }),
            Err(status) => json!({ "error": status_json(&status) }),
        };
        Ok::<_, Infallible>(format!("{line}\n"))
    });

    let mut response = Response::new(Body::wrap_stream(lines));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

async fn forward(
    request: Request<Body>,
    mut client: SdkClient<Channel>,
) -> Result<Response<Body>, Status> {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();

    let response = match (&method, path.as_str()) {
        (&Method::POST, "/ready") => {
            client.ready(Empty {}).await?;
            empty_response()
        }
        (&Method::POST, "/allocate") => {
            client.allocate(Empty {}).await?;
            empty_response()
        }
        (&Method::POST, "/shutdown") => {
            client.shutdown(Empty {}).await?;
            empty_response()
        }
        (&Method::POST, "/health") => {
            client.health(tokio_stream::once(Empty {})).await?;
            empty_response()
        }
        (&Method::POST, "/reserve") => {
            let seconds = reserve_seconds(&read_json::<Value>(request).await?)?;
            client.reserve(sdk::Duration { seconds }).await?;
            empty_response()
        }
        (&Method::GET, "/gameserver") => {
            let gs = client.get_game_server(Empty {}).await?.into_inner();
            json_response(StatusCode::OK, &game_server_json(&gs))
        }
        (&Method::GET, "/watch/gameserver") => {
            watch_response(client.watch_game_server(Empty {}).await?.into_inner())
        }
        (&Method::PUT, "/metadata/label") => {
            let kv: KeyValueBody = read_json(request).await?;
            client.set_label(KeyValue::from(kv)).await?;
            empty_response()
        }
        (&Method::PUT, "/metadata/annotation") => {
            let kv: KeyValueBody = read_json(request).await?;
            client.set_annotation(KeyValue::from(kv)).await?;
            empty_response()
        }
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

/// Handles a single gateway request, answering gRPC failures with the
/// matching HTTP status.
pub async fn gateway(request: Request<Body>, client: SdkClient<Channel>) -> Response<Body> {
    let path = request.uri().path().to_owned();
    match forward(request, client).await {
        Ok(response) => response,
        Err(status) => {
            tracing::debug!(%path, %status, "sdk gateway request failed");
            json_response(http_status(status.code()), &status_json(&status))
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        sdkserver::LocalSdk,
        signal::{channel, ShutdownKind},
    };

    async fn body_json(response: Response<Body>) -> Value {
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn health_routes() {
        let get = |path: &str| Request::get(path).body(Body::empty()).unwrap();

        assert_eq!(
            StatusCode::OK,
            health_response(&get("/healthz"), &|| false).status()
        );
        assert_eq!(
            StatusCode::OK,
            health_response(&get("/gshealthz"), &|| true).status()
        );
        assert_eq!(
            StatusCode::INTERNAL_SERVER_ERROR,
            health_response(&get("/gshealthz"), &|| false).status()
        );
        assert_eq!(
            StatusCode::NOT_FOUND,
            health_response(&get("/metrics"), &|| true).status()
        );
    }

    #[test]
    fn reserve_body() {
        assert_eq!(10, reserve_seconds(&json!({ "seconds": "10" })).unwrap());
        assert_eq!(10, reserve_seconds(&json!({ "seconds": 10 })).unwrap());
        assert_eq!(0, reserve_seconds(&json!({})).unwrap());
        assert!(reserve_seconds(&json!({ "seconds": "soon" })).is_err());
    }

    #[tokio::test]
    async fn gateway_forwards_to_grpc() {
        let sdk = Arc::new(LocalSdk::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = channel(ShutdownKind::Testing);
        let server = tokio::spawn(crate::sdkserver::serve(sdk.clone(), listener, shutdown_rx));

        let client = SdkClient::new(
            tonic::transport::Endpoint::from_shared(format!("http://{address}"))
                .unwrap()
                .connect_lazy(),
        );
        let request = |method: Method, path: &str, body: &str| {
            Request::builder()
                .method(method)
                .uri(path)
                .body(Body::from(body.to_owned()))
                .unwrap()
        };

        let response = gateway(request(Method::POST, "/allocate", ""), client.clone()).await;
        assert_eq!(StatusCode::OK, response.status());

        let response = gateway(
            request(
                Method::PUT,
                "/metadata/label",
                r#"{"key": "mode", "value": "ranked"}"#,
            ),
            client.clone(),
        )
        .await;
        assert_eq!(StatusCode::OK, response.status());

        let response = gateway(request(Method::GET, "/gameserver", ""), client.clone()).await;
        assert_eq!(StatusCode::OK, response.status());
        let gs = body_json(response).await;
        assert_eq!("Allocated", gs["status"]["state"]);
        assert_eq!("ranked", gs["object_meta"]["labels"]["agones.dev/sdk-mode"]);
        assert_eq!(7777, gs["status"]["ports"][0]["port"]);

        let response = gateway(
            request(Method::PUT, "/metadata/annotation", "not json"),
            client.clone(),
        )
        .await;
        assert_eq!(StatusCode::BAD_REQUEST, response.status());

        let response = gateway(request(Method::GET, "/nope", ""), client.clone()).await;
        assert_eq!(StatusCode::NOT_FOUND, response.status());

        let response = gateway(request(Method::POST, "/health", ""), client).await;
        assert_eq!(StatusCode::OK, response.status());

        shutdown_tx.send(ShutdownKind::Testing).unwrap();
        server.await.unwrap().unwrap();
    }
}
