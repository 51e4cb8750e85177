//! Message-sending HTTP API.
//!
//! Every endpoint answers `{"status": bool, "response": string}`. Bodies are
//! accepted as JSON or as `application/x-www-form-urlencoded`.

use std::sync::Arc;

use {
    axum::{
        Form, Json,
        body::Bytes,
        extract::{FromRequest, Request, State},
        http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
        response::{IntoResponse, Response},
    },
    serde::{Deserialize, Serialize, de::DeserializeOwned},
    tracing::{info, warn},
};

use wagate_whatsapp::SendError;

use crate::state::GatewayState;

/// Response envelope shared by all send endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: bool,
    pub response: String,
}

pub(crate) fn reply(code: StatusCode, status: bool, response: impl Into<String>) -> Response {
    (code, Json(ApiResponse {
        status,
        response: response.into(),
    }))
        .into_response()
}

// ── Body extraction ──────────────────────────────────────────────────────────

/// JSON or urlencoded form body. An empty body decodes as `{}` so missing
/// fields are reported by the handler rather than as a rejection.
pub struct Payload<T>(pub T);

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
}

impl<S, T> FromRequest<S> for Payload<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        if is_form(req.headers()) {
            let Form(value) = Form::<T>::from_request(req, state)
                .await
                .map_err(|e| reply(StatusCode::BAD_REQUEST, false, e.body_text()))?;
            return Ok(Self(value));
        }

        let raw = Bytes::from_request(req, state)
            .await
            .map_err(|e| reply(StatusCode::BAD_REQUEST, false, e.body_text()))?;
        let body: &[u8] = if raw.iter().all(u8::is_ascii_whitespace) {
            b"{}"
        } else {
            &raw
        };
        serde_json::from_slice(body).map(Self).map_err(|e| {
            reply(
                StatusCode::BAD_REQUEST,
                false,
                format!("Invalid request body: {e}"),
            )
        })
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub number: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SendGroupMessageRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "groupId")]
    pub group_id: Option<String>,
}

fn not_connected() -> Response {
    reply(
        StatusCode::INTERNAL_SERVER_ERROR,
        false,
        "WhatsApp belum terhubung.",
    )
}

/// `POST /send-message`
pub async fn send_message(
    State(state): State<Arc<GatewayState>>,
    Payload(req): Payload<SendMessageRequest>,
) -> Response {
    let Some(number) = req.number.filter(|n| !n.is_empty()) else {
        return reply(StatusCode::BAD_REQUEST, false, "Nomor WA belum disertakan!");
    };
    let recipient = state.jid.user(&number);
    let text = req.message.unwrap_or_default();

    match state.manager.send_direct(&recipient, &text).await {
        Ok(()) => reply(StatusCode::OK, true, "Message sent successfully"),
        Err(SendError::NotRegistered(_)) => reply(
            StatusCode::BAD_REQUEST,
            false,
            format!("Nomor {number} tidak terdaftar."),
        ),
        Err(SendError::NotConnected) => not_connected(),
        Err(SendError::SendFailure(e)) => {
            warn!(to = %recipient, error = %e, "send failed");
            reply(StatusCode::INTERNAL_SERVER_ERROR, false, e)
        },
    }
}

/// `POST /send-group-message`
pub async fn send_group_message(
    State(state): State<Arc<GatewayState>>,
    Payload(req): Payload<SendGroupMessageRequest>,
) -> Response {
    let Some(group_id) = req.group_id.filter(|g| !g.is_empty()) else {
        return reply(StatusCode::BAD_REQUEST, false, "ID grup belum disertakan!");
    };
    let text = req.message.unwrap_or_default();

    match state.manager.send_to_group(&group_id, &text).await {
        Ok(()) => reply(
            StatusCode::OK,
            true,
            "Message sent successfully to the group",
        ),
        Err(SendError::NotConnected) => not_connected(),
        Err(e) => {
            warn!(to = %group_id, error = %e, "group send failed");
            reply(StatusCode::INTERNAL_SERVER_ERROR, false, e.to_string())
        },
    }
}

/// `POST /session/restart`
pub async fn restart_session(State(state): State<Arc<GatewayState>>) -> Response {
    info!("session restart requested");
    match state.manager.restart().await {
        Ok(()) => reply(StatusCode::OK, true, "Restarting WhatsApp connection"),
        Err(e) => reply(StatusCode::INTERNAL_SERVER_ERROR, false, format!("{e:#}")),
    }
}
