// src/actions.rs

//! Response transforms selected by a matching rule.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use http::header::LOCATION;
use http::{HeaderMap, HeaderValue};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::store::{Resource, ResourceStore};

pub const TEXT_PLAIN_UTF8: &str = "text/plain; charset=utf-8";
pub const DEFAULT_REDIRECT_STATUS: u16 = 302;
pub const DEFAULT_BLOCK_STATUS: u16 = 403;
pub const DEFAULT_BLOCK_BODY: &str = "Blocked";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    #[default]
    #[serde(alias = "utf8")]
    Text,
    Base64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Action {
    ReplaceBody {
        #[serde(default)]
        body: String,
        #[serde(default)]
        body_type: BodyEncoding,
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        content_type: Option<String>,
    },
    ReplaceResource {
        #[serde(default)]
        resource_id: String,
        #[serde(default)]
        status: Option<u16>,
    },
    Redirect {
        #[serde(default)]
        location: String,
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        body_type: BodyEncoding,
        #[serde(default)]
        content_type: Option<String>,
    },
    Block {
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        body_type: BodyEncoding,
        #[serde(default)]
        content_type: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Response as seen by the resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseParts {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub content_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    ResourceNotFound,
    InvalidLocation,
}

impl ResolveError {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolveError::ResourceNotFound => "resource_not_found",
            ResolveError::InvalidLocation => "invalid_location",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub response: ResponseParts,
    pub modified: bool,
    pub error: Option<ResolveError>,
}

impl Resolution {
    fn unchanged(response: ResponseParts) -> Self {
        Resolution {
            response,
            modified: false,
            error: None,
        }
    }

    fn failed(response: ResponseParts, error: ResolveError) -> Self {
        Resolution {
            response,
            modified: false,
            error: Some(error),
        }
    }

    fn changed(response: ResponseParts) -> Self {
        Resolution {
            response,
            modified: true,
            error: None,
        }
    }
}

fn decode_body(body: &str, encoding: BodyEncoding) -> Bytes {
    match encoding {
        BodyEncoding::Text => Bytes::copy_from_slice(body.as_bytes()),
        BodyEncoding::Base64 => match BASE64.decode(body.trim()) {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                warn!("Invalid base64 body in rule action: {}", e);
                Bytes::new()
            }
        },
    }
}

/// Applies `action` to `response`.
///
/// Never fails: a missing resource or an unusable redirect target leaves the
/// response untouched and reports the reason in [`Resolution::error`].
pub fn resolve_action(
    action: Option<&Action>,
    response: ResponseParts,
    resources: Option<&dyn ResourceStore>,
) -> Resolution {
    let Some(action) = action else {
        return Resolution::unchanged(response);
    };

    match action {
        Action::ReplaceBody {
            body,
            body_type,
            status,
            content_type,
        } => {
            let mut out = response;
            out.body = decode_body(body, *body_type);
            if let Some(status) = status {
                out.status = *status;
            }
            if let Some(content_type) = content_type {
                out.content_type = content_type.clone();
            }
            Resolution::changed(out)
        }

        Action::ReplaceResource {
            resource_id,
            status,
        } => {
            let Some(resource) = resources.and_then(|store| store.get(resource_id)) else {
                return Resolution::failed(response, ResolveError::ResourceNotFound);
            };
            let mut out = response;
            out.body = decode_body(&resource.data_base64, BodyEncoding::Base64);
            if let Some(content_type) = resource.content_type {
                out.content_type = content_type;
            }
            if let Some(status) = status {
                out.status = *status;
            }
            Resolution::changed(out)
        }

        Action::Redirect {
            location,
            status,
            body,
            body_type,
            content_type,
        } => {
            let value = match HeaderValue::from_str(location.trim()) {
                Ok(value) if !value.is_empty() => value,
                _ => return Resolution::failed(response, ResolveError::InvalidLocation),
            };
            let mut out = response;
            out.status = status.unwrap_or(DEFAULT_REDIRECT_STATUS);
            out.headers.insert(LOCATION, value);
            out.body = body
                .as_deref()
                .map(|b| decode_body(b, *body_type))
                .unwrap_or_default();
            if let Some(content_type) = content_type {
                out.content_type = content_type.clone();
            } else if !out.body.is_empty() {
                out.content_type = TEXT_PLAIN_UTF8.to_string();
            }
            Resolution::changed(out)
        }

        Action::Block {
            status,
            body,
            body_type,
            content_type,
        } => {
            let mut out = response;
            out.status = status.unwrap_or(DEFAULT_BLOCK_STATUS);
            out.body = match body {
                Some(b) => decode_body(b, *body_type),
                None => Bytes::from_static(DEFAULT_BLOCK_BODY.as_bytes()),
            };
            out.content_type = content_type
                .clone()
                .unwrap_or_else(|| TEXT_PLAIN_UTF8.to_string());
            Resolution::changed(out)
        }

        Action::Unknown => Resolution::unchanged(response),
    }
}
