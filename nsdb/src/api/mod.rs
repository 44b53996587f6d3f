//! HTTP API layer mapping routes onto store operations.

use axum::{
    body::Bytes,
    extract::{
        rejection::PathRejection, FromRequest, FromRequestParts, Path, Request, State,
    },
    http::{request::Parts, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, MethodRouter},
    Extension, Json, Router,
};
use nsdb_core::{AuthLevel, Dispatcher, Operation, Reply, RequestContext};
use serde_json::Value;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};
use uuid::Uuid;

pub mod auth_middleware;

use auth_middleware::{require_auth, Caller};

pub const HELLO: &str = "Hello From Server!";
pub const NOT_FOUND: &str = "Resource Not Found";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

/// Decoded path parameters of a matched route, in order.
///
/// Every route is `/<group>/<verb>/...`, so the first parameter is path
/// segment 2, the second segment 3 and so on.
#[derive(Clone, Debug, Default)]
pub struct PathComponents(Vec<String>);

impl PathComponents {
    pub fn segment(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(2)
            .and_then(|i| self.0.get(i))
            .map(String::as_str)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.segment(2)
    }

    pub fn into_context(self, level: AuthLevel, data: Option<Value>) -> RequestContext {
        let at = |i: usize| self.segment(i).map(str::to_string);
        RequestContext {
            level,
            namespace: at(2),
            collection: at(3),
            document: at(4),
            db_user: at(2),
            ns_user: at(3),
            data,
        }
    }
}

impl<S> FromRequestParts<S> for PathComponents
where
    S: Send + Sync,
{
    type Rejection = PathRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(params) = Path::<Vec<(String, String)>>::from_request_parts(parts, state).await?;
        Ok(Self(params.into_iter().map(|(_, value)| value).collect()))
    }
}

/// The `data` member of a JSON object body.
pub struct Payload(pub Option<Value>);

impl<S> FromRequest<S> for Payload
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(IntoResponse::into_response)?;
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(mut body)) if body.contains_key("data") => {
                Ok(Self(body.remove("data")))
            }
            _ => Err((
                StatusCode::BAD_REQUEST,
                "Request body must be a JSON object with a data member",
            )
                .into_response()),
        }
    }
}

/// Dispatch on the blocking pool; successful writes may save to disk.
async fn execute(
    state: AppState,
    op: Operation,
    caller: Caller,
    components: PathComponents,
    data: Option<Value>,
) -> Response {
    let ctx = components.into_context(caller.level, data);
    let dispatcher = state.dispatcher.clone();
    let reply = match tokio::task::spawn_blocking(move || dispatcher.dispatch(op, &ctx)).await {
        Ok(reply) => reply,
        Err(err) => {
            error!(operation = %op, error = %err, "dispatch task failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(Reply::err("Internal Server Error")),
            )
                .into_response();
        }
    };
    if let Some(error) = &reply.error {
        debug!(operation = %op, user = %caller.username, %error, "operation refused");
    }
    Json(reply).into_response()
}

fn query(op: Operation) -> MethodRouter<AppState> {
    get(
        move |State(state): State<AppState>,
              Extension(caller): Extension<Caller>,
              components: PathComponents| {
            execute(state, op, caller, components, None)
        },
    )
}

fn submit(op: Operation) -> MethodRouter<AppState> {
    post(
        move |State(state): State<AppState>,
              Extension(caller): Extension<Caller>,
              components: PathComponents,
              Payload(data): Payload| {
            execute(state, op, caller, components, data)
        },
    )
}

async fn hello() -> Json<Reply> {
    Json(Reply::ok(Some(HELLO.into())))
}

async fn not_found() -> (StatusCode, Json<Reply>) {
    (StatusCode::NOT_FOUND, Json(Reply::err(NOT_FOUND)))
}

/// One log line per request, tagged with a generated request id.
async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let request_id = Uuid::new_v4().to_string();

    let mut response = next.run(request).await;
    let code = response.status();
    let status = if code.is_success() { "accepted" } else { "dropped" };
    info!(
        %request_id,
        %method,
        %uri,
        status,
        code = code.as_u16(),
        message = code.canonical_reason().unwrap_or_default(),
        "request"
    );
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

pub fn router(state: AppState) -> Router {
    let operations = Router::new()
        .route("/nsp/new/{ns}", query(Operation::CreateNamespace))
        .route("/nsp/del/{ns}", query(Operation::RemoveNamespace))
        .route("/nsp/all", query(Operation::GetAllNamespaces))
        .route("/dbu/new/{user}", submit(Operation::CreateDatabaseUser))
        .route("/dbu/del/{user}", query(Operation::RemoveDatabaseUser))
        .route("/dbu/get/{user}", query(Operation::GetDatabaseUser))
        .route("/dbu/all", query(Operation::GetAllDatabaseUsers))
        .route("/col/new/{ns}/{col}", query(Operation::CreateCollection))
        .route("/col/del/{ns}/{col}", query(Operation::RemoveCollection))
        .route("/col/all/{ns}", query(Operation::GetAllCollections))
        .route("/doc/new/{ns}/{col}/{doc}", submit(Operation::CreateDocument))
        .route("/doc/del/{ns}/{col}/{doc}", query(Operation::RemoveDocument))
        .route("/doc/get/{ns}/{col}/{doc}", query(Operation::GetDocument))
        .route("/doc/all/{ns}/{col}", query(Operation::GetAllDocuments))
        .route("/usr/new/{ns}/{user}", submit(Operation::CreateNamespaceUser))
        .route("/usr/del/{ns}/{user}", query(Operation::RemoveNamespaceUser))
        .route("/usr/get/{ns}/{user}", query(Operation::GetNamespaceUser))
        .route("/usr/all/{ns}", query(Operation::GetAllNamespaceUsers))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/", get(hello))
        .merge(operations)
        .fallback(not_found)
        .layer(middleware::from_fn(log_request))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{self, Body},
        http::{header, Request},
    };
    use base64::{engine::general_purpose::STANDARD, Engine};
    use nsdb_core::{auth::hash_password, Database, DebounceConfig};
    use parking_lot::RwLock;
    use serde_json::json;
    use tower::util::ServiceExt;

    fn app() -> (tempfile::TempDir, Router) {
        let tempdir = tempfile::tempdir().unwrap();
        let mut db = Database::new(
            tempdir.path().join("storage"),
            tempdir.path().join("config.snap"),
        );
        db.create_database_user("root", "root").unwrap();
        let dispatcher = Dispatcher::new(Arc::new(RwLock::new(db)), DebounceConfig::default());
        let app = router(AppState::new(Arc::new(dispatcher)));
        (tempdir, app)
    }

    fn basic(user: &str, password: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
    }

    fn get_as(uri: &str, user: &str, password: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, basic(user, password))
            .body(Body::empty())
            .unwrap()
    }

    fn post_as(uri: &str, user: &str, password: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::AUTHORIZATION, basic(user, password))
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap()
    }

    async fn reply(app: &Router, req: Request<Body>) -> Reply {
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn hello_is_public() {
        let (_dir, app) = app();
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("x-request-id"));
        let body = body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v, json!({"ok": true, "data": HELLO}));
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let (_dir, app) = app();
        let req = Request::builder()
            .uri("/nope/at/all")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v, json!({"ok": false, "error": NOT_FOUND}));

        // Auth only guards matched routes.
        let req = Request::builder()
            .uri("/nope/at/all")
            .header(header::AUTHORIZATION, basic("nobody", "wrong"))
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_credentials_get_challenge() {
        let (_dir, app) = app();
        let req = Request::builder()
            .uri("/nsp/all")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            resp.headers()[header::WWW_AUTHENTICATE],
            auth_middleware::CHALLENGE
        );
    }

    #[tokio::test]
    async fn bad_credentials_are_forbidden() {
        let (_dir, app) = app();
        let resp = app
            .clone()
            .oneshot(get_as("/nsp/all", "root", "wrong"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let req = Request::builder()
            .uri("/nsp/all")
            .header(header::AUTHORIZATION, "Basic !!!not-base64")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let req = Request::builder()
            .uri("/nsp/all")
            .header(header::AUTHORIZATION, "Bearer token")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn namespace_lifecycle_as_root() {
        let (dir, app) = app();
        let r = reply(&app, get_as("/nsp/new/shop", "root", "root")).await;
        assert_eq!(r, Reply::ok(None));
        assert!(dir.path().join("storage").join("shop").is_file());

        let r = reply(&app, get_as("/nsp/all", "root", "root")).await;
        assert_eq!(r.data, Some(json!(["shop"])));

        let r = reply(&app, get_as("/nsp/new/shop", "root", "root")).await;
        assert_eq!(r.error.as_deref(), Some("Cannot create existing namespace [shop]"));

        let r = reply(&app, get_as("/nsp/del/shop", "root", "root")).await;
        assert!(r.ok);
        let r = reply(&app, get_as("/nsp/all", "root", "root")).await;
        assert_eq!(r.data, Some(json!([])));
    }

    #[tokio::test]
    async fn namespace_user_works_inside_its_namespace() {
        let (_dir, app) = app();
        reply(&app, get_as("/nsp/new/shop", "root", "root")).await;

        let r = reply(&app, get_as("/col/new/shop/orders", "user", "user")).await;
        assert!(r.ok, "{r:?}");

        let body = json!({"data": "3 apples"}).to_string();
        let r = reply(&app, post_as("/doc/new/shop/orders/o-1", "user", "user", body)).await;
        assert!(r.ok, "{r:?}");

        let r = reply(&app, get_as("/doc/get/shop/orders/o-1", "user", "user")).await;
        assert_eq!(r.data, Some(json!("3 apples")));
        let r = reply(&app, get_as("/doc/all/shop/orders", "user", "user")).await;
        assert_eq!(r.data, Some(json!(["o-1"])));
        let r = reply(&app, get_as("/col/all/shop", "user", "user")).await;
        assert_eq!(r.data, Some(json!(["orders"])));
    }

    #[tokio::test]
    async fn levels_do_not_nest() {
        let (_dir, app) = app();
        reply(&app, get_as("/nsp/new/shop", "root", "root")).await;

        let r = reply(&app, get_as("/col/new/shop/orders", "root", "root")).await;
        assert_eq!(r, Reply::err("Permission Denied: createCollection"));

        // Namespace users are only known inside their namespace.
        let resp = app
            .clone()
            .oneshot(get_as("/nsp/all", "user", "user"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let r = reply(&app, get_as("/dbu/get/shop", "user", "user")).await;
        assert_eq!(r, Reply::err("Permission Denied: getDatabaseUser"));
    }

    #[tokio::test]
    async fn body_must_carry_data() {
        let (_dir, app) = app();
        reply(&app, get_as("/nsp/new/shop", "root", "root")).await;
        reply(&app, get_as("/col/new/shop/orders", "user", "user")).await;

        for body in ["not json", "[1,2]", "{\"payload\": 1}"] {
            let resp = app
                .clone()
                .oneshot(post_as("/doc/new/shop/orders/o-1", "user", "user", body))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{body}");
        }

        let body = json!({"data": {"qty": 1}}).to_string();
        let r = reply(&app, post_as("/doc/new/shop/orders/o-1", "user", "user", body)).await;
        assert!(r.ok);
        let r = reply(&app, get_as("/doc/get/shop/orders/o-1", "user", "user")).await;
        assert_eq!(r.data, Some(json!("{\"qty\":1}")));
    }

    #[tokio::test]
    async fn user_management() {
        let (dir, app) = app();
        let body = json!({"data": "ops-pw"}).to_string();
        let r = reply(&app, post_as("/dbu/new/ops", "root", "root", body)).await;
        assert!(r.ok);
        assert!(dir.path().join("config.snap").is_file());

        let r = reply(&app, get_as("/dbu/get/ops", "ops", "ops-pw")).await;
        assert_eq!(r.data, Some(json!(hash_password("ops-pw"))));
        let r = reply(&app, get_as("/dbu/del/root", "ops", "ops-pw")).await;
        assert_eq!(r.error.as_deref(), Some("Impossible to remove root user [root]"));

        reply(&app, get_as("/nsp/new/shop", "root", "root")).await;
        let body = json!({"data": "pw"}).to_string();
        let r = reply(&app, post_as("/usr/new/shop/clerk", "user", "user", body)).await;
        assert!(r.ok);
        let r = reply(&app, get_as("/usr/del/shop/user", "clerk", "pw")).await;
        assert!(r.ok);
        let r = reply(&app, get_as("/usr/all/shop", "clerk", "pw")).await;
        assert_eq!(r.data, Some(json!(["clerk"])));
        let r = reply(&app, get_as("/usr/del/shop/clerk", "clerk", "pw")).await;
        assert!(!r.ok);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_writes_all_reach_disk() {
        let (dir, app) = app();
        reply(&app, get_as("/nsp/new/shop", "root", "root")).await;
        reply(&app, get_as("/col/new/shop/orders", "user", "user")).await;

        let mut tasks = Vec::new();
        for i in 0..40 {
            let app = app.clone();
            tasks.push(tokio::spawn(async move {
                let body = json!({"data": format!("pw-{i}")}).to_string();
                let user = reply(&app, post_as(&format!("/dbu/new/ops-{i:02}"), "root", "root", body)).await;
                let body = json!({"data": i}).to_string();
                let doc = reply(
                    &app,
                    post_as(&format!("/doc/new/shop/orders/o-{i:02}"), "user", "user", body),
                )
                .await;
                (user, doc)
            }));
        }
        for task in tasks {
            let (user, doc) = task.await.unwrap();
            assert!(user.ok, "{user:?}");
            assert!(doc.ok, "{doc:?}");
        }

        let saved = reply(&app, get_as("/nsp/all", "root", "root")).await;
        assert_eq!(saved.data, Some(json!(["shop"])));
        let booted = Database::boot(
            dir.path().join("storage"),
            dir.path().join("config.snap"),
            "ignored",
        )
        .unwrap();
        assert_eq!(booted.list_database_users().unwrap().len(), 41);
    }

    #[test]
    fn components_map_onto_segments() {
        let components = PathComponents(vec!["shop".into(), "orders".into(), "o-1".into()]);
        assert_eq!(components.segment(1), None);
        assert_eq!(components.namespace(), Some("shop"));
        let ctx = components.into_context(AuthLevel::Namespace, None);
        assert_eq!(ctx.collection.as_deref(), Some("orders"));
        assert_eq!(ctx.ns_user.as_deref(), Some("orders"));
        assert_eq!(ctx.document.as_deref(), Some("o-1"));
        assert_eq!(ctx.db_user.as_deref(), Some("shop"));
    }
}
