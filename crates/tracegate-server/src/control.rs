//! Control request dispatch.
//!
//! Resolves the bearer token to a principal, forwards the request to the
//! session controller and maps the outcome to a status-coded response.

use crate::auth::TokenDirectory;
use serde_json::{json, Value};
use std::sync::Arc;
use tracegate_core::{
    ControlEnvelope, ControlError, ControlRequest, ControlResponse, ControlResult, Identity,
    SessionController,
};
use tracing::debug;

pub struct ControlService {
    controller: Arc<SessionController>,
    tokens: TokenDirectory,
}

impl ControlService {
    /// Serve `controller` to the principals in `tokens`.
    pub fn new(controller: Arc<SessionController>, tokens: TokenDirectory) -> Self {
        Self { controller, tokens }
    }

    /// Handle one raw request line.
    pub async fn handle_line(&self, line: &str) -> ControlResponse {
        match serde_json::from_str::<ControlEnvelope>(line) {
            Ok(envelope) => self.handle(envelope).await,
            Err(e) => ControlResponse::error(400, "bad_request", format!("invalid request: {e}")),
        }
    }

    /// Authenticate and execute one request.
    pub async fn handle(&self, envelope: ControlEnvelope) -> ControlResponse {
        let Some(identity) = self.tokens.resolve(&envelope.token) else {
            return ControlResponse::error(401, "unauthenticated", "unknown or missing token");
        };
        let op = envelope.request.op();
        match self.dispatch(identity, envelope.request).await {
            Ok(body) => ControlResponse::ok(body),
            Err(e) => {
                debug!(requester = %identity, op, code = e.code(), error = %e, "request failed");
                ControlResponse::from_error(&e)
            }
        }
    }

    async fn dispatch(&self, identity: &Identity, request: ControlRequest) -> ControlResult<Value> {
        let controller = &self.controller;
        match request {
            ControlRequest::Start { config } => {
                let id = controller.start_session(identity, config).await?;
                let summary = controller.describe_session(identity, &id).await?;
                Ok(json!(summary))
            }
            ControlRequest::Stop { session_id } => {
                match controller.stop_session(identity, &session_id).await {
                    Ok(artifact) => Ok(json!({
                        "outcome": "stopped",
                        "session_id": session_id,
                        "artifact": artifact,
                    })),
                    // Lost a race with another stop or the sweep.
                    Err(ControlError::InvalidTransition { actual, .. }) => Ok(json!({
                        "outcome": "no_op",
                        "session_id": session_id,
                        "state": actual,
                    })),
                    Err(e) => Err(e),
                }
            }
            ControlRequest::Get { session_id } => {
                let summary = controller.describe_session(identity, &session_id).await?;
                Ok(json!(summary))
            }
            ControlRequest::List { filter } => {
                let sessions = controller.list_sessions(identity, &filter).await?;
                Ok(json!({ "sessions": sessions }))
            }
            ControlRequest::Fetch { session_id } => {
                let bytes = controller.fetch_artifact(identity, &session_id).await?;
                Ok(json!({
                    "session_id": session_id,
                    "size": bytes.len(),
                    "data": hex::encode(&bytes),
                }))
            }
            ControlRequest::Emit { event } => {
                let accepted = controller.emit(identity, event)?;
                Ok(json!({ "accepted": accepted }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::hash_token;
    use tracegate_core::{
        CaptureEngine, GovernorPolicy, MemoryArtifactStore, PrincipalGrant, StaticAccessPolicy,
    };

    fn service() -> ControlService {
        let access = StaticAccessPolicy::new(vec![
            PrincipalGrant::full_access("alice"),
            PrincipalGrant::full_access("bob"),
        ]);
        let controller = SessionController::builder(
            Arc::new(CaptureEngine::new()),
            Arc::new(MemoryArtifactStore::new()),
            Arc::new(access),
        )
        .policy(GovernorPolicy {
            max_concurrent_sessions: 1,
            min_interval_between_starts: std::time::Duration::ZERO,
            starts_per_window: 0,
            ..GovernorPolicy::default()
        })
        .build();

        let mut tokens = TokenDirectory::new();
        tokens.insert(&hash_token("alice-token"), Identity::new("alice"));
        tokens.insert(&hash_token("bob-token"), Identity::new("bob"));
        ControlService::new(Arc::new(controller), tokens)
    }

    fn line(token: &str, request: Value) -> String {
        json!({ "token": token, "request": request }).to_string()
    }

    async fn start(svc: &ControlService, token: &str) -> ControlResponse {
        svc.handle_line(&line(token, json!({"op": "start", "config": {"preset": "default"}})))
            .await
    }

    #[tokio::test]
    async fn malformed_and_unauthenticated() {
        let svc = service();
        assert_eq!(svc.handle_line("not json").await.status, 400);
        let res = svc.handle_line(&line("nope", json!({"op": "list"}))).await;
        assert_eq!(res.status, 401);
        assert_eq!(res.error.unwrap().code, "unauthenticated");
    }

    #[tokio::test]
    async fn start_stop_fetch() {
        let svc = service();
        let started = start(&svc, "alice-token").await;
        assert_eq!(started.status, 200);
        let body = started.body.unwrap();
        assert_eq!(body["state"], "running");
        let id = body["id"].as_str().unwrap().to_string();

        let busy = start(&svc, "bob-token").await;
        assert_eq!(busy.status, 429);
        assert_eq!(busy.error.unwrap().code, "admission_rejected");

        let stopped = svc
            .handle_line(&line("alice-token", json!({"op": "stop", "session_id": id})))
            .await;
        assert_eq!(stopped.status, 200);
        assert_eq!(stopped.body.unwrap()["outcome"], "stopped");

        let again = svc
            .handle_line(&line("alice-token", json!({"op": "stop", "session_id": id})))
            .await;
        assert_eq!(again.status, 200);
        let again = again.body.unwrap();
        assert_eq!(again["outcome"], "no_op");
        assert_eq!(again["state"], "completed");

        let fetched = svc
            .handle_line(&line("alice-token", json!({"op": "fetch", "session_id": id})))
            .await;
        assert_eq!(fetched.status, 200);
        let data = fetched.body.unwrap()["data"].as_str().unwrap().to_string();
        assert!(!hex::decode(data).unwrap().is_empty());

        assert_eq!(start(&svc, "bob-token").await.status, 200);
    }

    #[tokio::test]
    async fn ownership_and_missing_sessions() {
        let svc = service();
        let id = start(&svc, "alice-token").await.body.unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string();

        for op in ["stop", "get", "fetch"] {
            let hidden = svc
                .handle_line(&line("bob-token", json!({"op": op, "session_id": id})))
                .await;
            assert_eq!(hidden.status, 404, "{op}");
            assert_eq!(hidden.error.unwrap().code, "not_found");
        }

        let missing = svc
            .handle_line(&line("alice-token", json!({"op": "get", "session_id": "nope"})))
            .await;
        assert_eq!(missing.status, 404);

        let listed = svc
            .handle_line(&line("bob-token", json!({"op": "list"})))
            .await;
        assert_eq!(listed.body.unwrap()["sessions"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn unknown_preset_is_unprocessable() {
        let svc = service();
        let res = svc
            .handle_line(&line(
                "alice-token",
                json!({"op": "start", "config": {"preset": "/etc/custom.jfc"}}),
            ))
            .await;
        assert_eq!(res.status, 422);
    }

    #[tokio::test]
    async fn emit_is_accepted() {
        let svc = service();
        let res = svc
            .handle_line(&line(
                "alice-token",
                json!({"op": "emit", "event": {"category": "app", "name": "checkpoint"}}),
            ))
            .await;
        assert_eq!(res.status, 200);
        assert_eq!(res.body.unwrap()["accepted"], true);
    }
}
