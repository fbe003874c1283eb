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

/// A failed request against the kubernetes API, classified by the way the
/// controllers react to it.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The object was modified since it was read.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// The object was rejected by validation.
    #[error("invalid: {0}")]
    Invalid(String),
    /// The object was rejected by policy.
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error(transparent)]
    Other(kube::Error),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// Whether the object itself was refused, so retrying cannot succeed.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Invalid(_) | Self::Forbidden(_))
    }
}

impl From<kube::Error> for ApiError {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) => match response.code {
                409 if response.reason == "AlreadyExists" => Self::AlreadyExists(response.message),
                409 => Self::Conflict(response.message),
                404 => Self::NotFound(response.message),
                422 => Self::Invalid(response.message),
                403 => Self::Forbidden(response.message),
                _ => Self::Other(kube::Error::Api(response)),
            },
            error => Self::Other(error),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(error: serde_json::Error) -> Self {
        Self::Other(kube::Error::SerdeError(error))
    }
}

/// An expected, transient condition such as a cache that has yet to observe
/// a write. The work queues retry these quietly.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TraceError(pub String);

/// Creates a [`TraceError`] report.
pub fn trace_error(message: impl Into<String>) -> eyre::Report {
    TraceError(message.into()).into()
}

/// Whether any error in the chain of `report` is a [`TraceError`].
pub fn is_trace(report: &eyre::Report) -> bool {
    report
        .chain()
        .any(|error| error.downcast_ref::<TraceError>().is_some())
}

/// Whether any error in the chain of `report` is an [`ApiError::Conflict`].
pub fn is_conflict(report: &eyre::Report) -> bool {
    report
        .chain()
        .filter_map(|error| error.downcast_ref::<ApiError>())
        .any(ApiError::is_conflict)
}
