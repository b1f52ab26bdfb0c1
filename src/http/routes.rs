//! ==============================================================================
//! http/routes.rs - request dispatch
//! ==============================================================================
//!
//! routes:
//!
//!     GET     /             settings form (html)
//!     POST    /             form submission -> persist -> 303 + restart
//!     GET     /api/config   {"config": {...}}
//!     PUT     /api/config   json merge -> persist -> 202 + restart
//!     GET     /api/status   {"device_id","timestamp","status","ip"}
//!     OPTIONS /api/*        204 + cors
//!
//! update sequencing:
//!     merge into a clone of the working copy, persist the clone, and only
//!     then swap it in. read-only storage still swaps (applied in memory, no
//!     restart); any other storage failure leaves the working copy alone.
//!
//! ==============================================================================

use std::net::Ipv4Addr;

use serde_json::json;
use tracing::{info, warn};

use super::request::Request;
use super::response::Response;
use crate::domain::now_iso8601;
use crate::lifecycle::RestartRequest;
use crate::settings::{is_valid_key, SettingValue, SettingsDocument};
use crate::store::{ConfigError, SettingsStore};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// What `/api/status` reports; assembled by the runtime for each poll.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub device_id: String,
    pub status: String,
    pub ip: Ipv4Addr,
}

/// Everything a handler may touch while serving one request.
pub struct RequestContext<'a> {
    pub settings: &'a mut SettingsDocument,
    pub store: &'a dyn SettingsStore,
    pub status: StatusSnapshot,
}

#[derive(Debug)]
pub struct Dispatch {
    pub response: Response,
    pub restart: Option<RestartRequest>,
}

impl From<Response> for Dispatch {
    fn from(response: Response) -> Self {
        Self { response, restart: None }
    }
}

enum UpdateOutcome {
    Persisted,
    InMemoryOnly(String),
}

pub fn dispatch(request: &Request, ctx: &mut RequestContext<'_>) -> Dispatch {
    let method = request.method.as_str();

    match request.path.as_str() {
        "/" => match method {
            "GET" => settings_form(ctx.settings).into(),
            "POST" => submit_form(request, ctx),
            _ => Response::text(405, "Method Not Allowed")
                .with_header("Allow", "GET, POST")
                .into(),
        },
        "/api/config" => match method {
            "GET" => get_config(ctx.settings).into(),
            "PUT" => put_config(request, ctx),
            "OPTIONS" => preflight().into(),
            _ => api_method_not_allowed("GET, PUT, OPTIONS").into(),
        },
        "/api/status" => match method {
            "GET" => get_status(&ctx.status).into(),
            "OPTIONS" => preflight().into(),
            _ => api_method_not_allowed("GET, OPTIONS").into(),
        },
        path if path.starts_with("/api/") => match method {
            "OPTIONS" => preflight().into(),
            _ => Response::error_json(404, "not_found", format!("no route for {}", path))
                .with_cors()
                .into(),
        },
        _ => Response::text(404, "Not Found").into(),
    }
}

// ==============================================================================
// html form
// ==============================================================================

fn settings_form(settings: &SettingsDocument) -> Response {
    let rows: Vec<String> = settings
        .iter()
        .map(|(key, value)| {
            let input_type = if key.ends_with("password") { "password" } else { "text" };
            let key = html_escape(key);
            format!(
                "<label>{key}: <input type=\"{input_type}\" name=\"{key}\" value=\"{value}\"></label><br>",
                key = key,
                input_type = input_type,
                value = html_escape(&value.to_string()),
            )
        })
        .collect();

    let page = format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Device settings</title></head>
<body>
<h1>Device settings</h1>
<form method="POST" action="/">
{}
<button type="submit">Save &amp; restart</button>
</form>
</body>
</html>"#,
        rows.join("\n")
    );
    Response::html(200, page)
}

fn submit_form(request: &Request, ctx: &mut RequestContext<'_>) -> Dispatch {
    if request.media_type().as_deref() != Some(FORM_CONTENT_TYPE) {
        return Response::text(415, "Unsupported Media Type").into();
    }

    let mut updates = Vec::new();
    for (key, raw) in form_urlencoded::parse(&request.body) {
        if key.is_empty() {
            continue;
        }
        if !is_valid_key(&key) {
            return Response::text(400, format!("Invalid setting name `{}`", key)).into();
        }
        let value = SettingValue::coerce_like(ctx.settings.get(&key), &raw);
        updates.push((key.into_owned(), value));
    }
    if updates.is_empty() {
        return Response::text(400, "No settings received.").into();
    }

    match apply_update(ctx, updates) {
        Ok(UpdateOutcome::Persisted) => Dispatch {
            response: Response::see_other("/", "Settings saved. Device is restarting."),
            restart: Some(RestartRequest::new("settings form submitted")),
        },
        Ok(UpdateOutcome::InMemoryOnly(detail)) => Response::text(
            200,
            format!("Settings applied until the next restart, not saved: {}", detail),
        )
        .into(),
        Err(e) => Response::text(500, format!("Saving settings failed: {}", e)).into(),
    }
}

// ==============================================================================
// json api
// ==============================================================================

fn get_config(settings: &SettingsDocument) -> Response {
    match serde_json::to_value(settings) {
        Ok(config) => Response::json(200, &json!({ "config": config })).with_cors(),
        Err(e) => Response::error_json(500, "encode_failed", e.to_string()).with_cors(),
    }
}

fn put_config(request: &Request, ctx: &mut RequestContext<'_>) -> Dispatch {
    if let Some(media_type) = request.media_type() {
        if media_type != "application/json" {
            return Response::error_json(415, "unsupported_media_type", "expected application/json")
                .with_cors()
                .into();
        }
    }

    let updates = match parse_config_update(&request.body) {
        Ok(updates) => updates,
        Err(response) => return response.with_cors().into(),
    };

    match apply_update(ctx, updates) {
        Ok(UpdateOutcome::Persisted) => Dispatch {
            response: Response::json(202, &json!({ "status": "accepted", "rebooting": true }))
                .with_cors(),
            restart: Some(RestartRequest::new("configuration updated over API")),
        },
        Ok(UpdateOutcome::InMemoryOnly(detail)) => Response::json(
            200,
            &json!({ "status": "applied_in_memory", "rebooting": false, "detail": detail }),
        )
        .with_cors()
        .into(),
        Err(e) => Response::error_json(500, "storage_error", e.to_string())
            .with_cors()
            .into(),
    }
}

/// Accepts `{"config": {...}}` or the bare object.
fn parse_config_update(body: &[u8]) -> Result<Vec<(String, SettingValue)>, Response> {
    let parsed: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| Response::error_json(400, "invalid_json", e.to_string()))?;

    let object = match parsed {
        serde_json::Value::Object(mut outer) => match outer.remove("config") {
            Some(serde_json::Value::Object(inner)) => inner,
            Some(other) => {
                outer.insert("config".to_string(), other);
                outer
            }
            None => outer,
        },
        _ => {
            return Err(Response::error_json(400, "invalid_json", "expected a JSON object"));
        }
    };

    if object.is_empty() {
        return Err(Response::error_json(400, "empty_update", "no settings received"));
    }

    object
        .into_iter()
        .map(|(key, value)| {
            if !is_valid_key(&key) {
                return Err(Response::error_json(
                    400,
                    "invalid_key",
                    format!("`{}` is not a valid setting name", key),
                ));
            }
            match SettingValue::from_json(&value) {
                Some(value) => Ok((key, value)),
                None => Err(Response::error_json(
                    400,
                    "invalid_value",
                    format!("`{}` must be a string, number or boolean", key),
                )),
            }
        })
        .collect()
}

fn get_status(status: &StatusSnapshot) -> Response {
    Response::json(
        200,
        &json!({
            "device_id": status.device_id,
            "timestamp": now_iso8601(),
            "status": status.status,
            "ip": status.ip.to_string(),
        }),
    )
    .with_cors()
}

fn preflight() -> Response {
    Response::new(204).with_cors()
}

fn api_method_not_allowed(allow: &str) -> Response {
    Response::error_json(405, "method_not_allowed", format!("allowed: {}", allow))
        .with_header("Allow", allow)
        .with_cors()
}

// ==============================================================================
// shared
// ==============================================================================

fn apply_update(
    ctx: &mut RequestContext<'_>,
    updates: Vec<(String, SettingValue)>,
) -> Result<UpdateOutcome, ConfigError> {
    let mut candidate = ctx.settings.clone();
    let changed = candidate.merge(updates);

    match ctx.store.persist(&candidate) {
        Ok(()) => {
            info!(changed, "Settings persisted");
            *ctx.settings = candidate;
            Ok(UpdateOutcome::Persisted)
        }
        Err(e @ ConfigError::StorageReadOnly(_)) => {
            warn!(changed, error = %e, "Storage is read-only, settings applied in memory only");
            *ctx.settings = candidate;
            Ok(UpdateOutcome::InMemoryOnly(e.to_string()))
        }
        Err(e) => {
            warn!(error = %e, "Persisting settings failed");
            Err(e)
        }
    }
}

/// escape html special characters to prevent xss
pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}
