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

mod health;

use std::convert::Infallible;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server as HyperServer, StatusCode};

pub use self::health::Health;
use crate::signal::ShutdownRx;

pub const PORT: u16 = 8000;

pub fn server(
    health: Health,
    address: Option<std::net::SocketAddr>,
    mut shutdown: ShutdownRx,
) -> tokio::task::JoinHandle<Result<(), hyper::Error>> {
    let address = address.unwrap_or_else(|| (std::net::Ipv6Addr::UNSPECIFIED, PORT).into());
    tracing::info!(address = %address, "Starting admin endpoint");

    let make_svc = make_service_fn(move |_conn| {
        let health = health.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let health = health.clone();
                async move {
                    let result = handle_request(req, health).await;
                    Ok::<_, Infallible>(map_result_into_response(result))
                }
            }))
        }
    });

    tokio::spawn(
        HyperServer::bind(&address)
            .serve(make_svc)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            }),
    )
}

/// Maps a handler result into a response, answering 500 for errors.
fn map_result_into_response(request: Result<Response<Body>, eyre::Error>) -> Response<Body> {
    match request {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(%error, "admin http server error");
            let mut response = Response::new(Body::from("internal error"));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

#[tracing::instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
async fn handle_request(
    request: Request<Body>,
    health: Health,
) -> Result<Response<Body>, eyre::Error> {
    tracing::trace!("handling request");

    match (request.method(), request.uri().path()) {
        (&Method::GET, "/metrics") => Ok(collect_metrics()),
        (&Method::GET, "/live" | "/livez") => Ok(health.check_liveness()),
        (&Method::GET, "/ready" | "/readyz") => Ok(health.check_readiness()),
        (_, path) => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from(format!("{path} not found")))
            .map_err(From::from),
    }
}

fn collect_metrics() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    let mut buffer = vec![];
    let encoder = prometheus::TextEncoder::new();
    let body =
        prometheus::Encoder::encode(&encoder, &crate::metrics::registry().gather(), &mut buffer)
            .map_err(|error| tracing::warn!(%error, "Failed to encode metrics"))
            .and_then(|_| {
                String::from_utf8(buffer)
                    .map(Body::from)
                    .map_err(|error| tracing::warn!(%error, "Failed to convert metrics to utf8"))
            });

    match body {
        Ok(body) => {
            *response.body_mut() = body;
        }
        Err(_) => {
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    response
}
