//! Service registry and dispatcher.
//!
//! Services are registered by name at startup. Each connection builds its
//! own method table from a service's factory the first time it calls that
//! service. Dispatch resolves `"Service.method"`, checks the service-level
//! and method-level permission tags, runs the method, and turns every
//! outcome (including a panic) into a value or a [`ServiceError`].

use crate::auth::Permissions;
use crate::events::EventRegistry;
use crate::resource::{ResourceError, ResourceTable};
use crate::session::{ConnectionId, Session};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use svcwire_protocol::message::{ErrorResponse, Request};
use svcwire_protocol::{ErrorCode, Value, WireError};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors produced by dispatch or by a method body.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("{message}")]
    Business {
        name: String,
        message: String,
        code: String,
        stack: Option<String>,
        detail: Option<Value>,
    },

    #[error("method panicked: {0}")]
    Panic(String),

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

impl ServiceError {
    /// A business failure with the given error name and message.
    pub fn business(name: impl Into<String>, message: impl Into<String>) -> Self {
        ServiceError::Business {
            name: name.into(),
            message: message.into(),
            code: ErrorCode::BusinessError.as_str().to_string(),
            stack: None,
            detail: None,
        }
    }

    /// Overrides the code of a business failure.
    pub fn with_code(mut self, new_code: impl Into<String>) -> Self {
        if let ServiceError::Business { code, .. } = &mut self {
            *code = new_code.into();
        }
        self
    }

    pub fn with_stack(mut self, new_stack: impl Into<String>) -> Self {
        if let ServiceError::Business { stack, .. } = &mut self {
            *stack = Some(new_stack.into());
        }
        self
    }

    pub fn with_detail(mut self, new_detail: Value) -> Self {
        if let ServiceError::Business { detail, .. } = &mut self {
            *detail = Some(new_detail);
        }
        self
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        ServiceError::BadRequest(message.into())
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServiceError::NotFound(_) => ErrorCode::NotFound,
            ServiceError::BadRequest(_) => ErrorCode::BadRequest,
            ServiceError::Unauthorized => ErrorCode::Unauthorized,
            ServiceError::Forbidden(_) => ErrorCode::Forbidden,
            ServiceError::Business { .. } => ErrorCode::BusinessError,
            ServiceError::Panic(_) | ServiceError::Internal(_) => ErrorCode::InternalError,
            ServiceError::Resource(e) => e.error_code(),
        }
    }

    /// Normalizes the error into its wire shape.
    pub fn to_response(&self) -> ErrorResponse {
        match self {
            ServiceError::Business {
                name,
                message,
                code,
                stack,
                detail,
            } => {
                let mut response = ErrorResponse::new(ErrorCode::BusinessError, message.clone())
                    .with_name(name.clone())
                    .with_code(code.clone());
                response.stack = stack.clone();
                response.detail = detail.clone();
                response
            }
            ServiceError::Forbidden(_) => {
                ErrorResponse::new(self.error_code(), self.to_string()).with_name("PermissionError")
            }
            _ => ErrorResponse::new(self.error_code(), self.to_string()),
        }
    }
}

impl From<WireError> for ServiceError {
    fn from(err: WireError) -> Self {
        let code = err
            .extra
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or(ErrorCode::BusinessError.as_str())
            .to_string();
        ServiceError::Business {
            name: err.name,
            message: err.message,
            code,
            stack: err.stack,
            detail: err.extra.get("detail").cloned(),
        }
    }
}

/// Per-connection context handed to service factories.
pub struct ServiceContext {
    pub connection_id: ConnectionId,
    pub client_id: String,
    pub client_name: Option<String>,
    pub permissions: Permissions,
    pub events: Arc<EventRegistry>,
    pub resources: Arc<ResourceTable>,
}

/// What a method body sees of the call.
#[derive(Clone)]
pub struct CallContext {
    pub connection: Arc<ServiceContext>,
    pub request_id: u64,
    /// Caller context from the request.
    pub url: String,
}

impl CallContext {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection.connection_id
    }

    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.connection.events
    }

    pub fn resources(&self) -> &Arc<ResourceTable> {
        &self.connection.resources
    }
}

/// Result of a method body.
pub type MethodResult = Result<Value, ServiceError>;

type Handler = Arc<dyn Fn(CallContext, Vec<Value>) -> BoxFuture<'static, MethodResult> + Send + Sync>;

struct MethodEntry {
    handler: Handler,
    permissions: Option<Vec<String>>,
}

/// Methods of one service instance, by name.
#[derive(Default)]
pub struct MethodTable {
    methods: HashMap<String, MethodEntry>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an async method.
    pub fn method<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx, params| f(ctx, params).boxed());
        self.methods.insert(
            name.to_string(),
            MethodEntry {
                handler,
                permissions: None,
            },
        );
        self
    }

    /// Adds a method that completes without awaiting.
    pub fn sync_method<F>(self, name: &str, f: F) -> Self
    where
        F: Fn(CallContext, Vec<Value>) -> MethodResult + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.method(name, move |ctx, params| {
            let f = f.clone();
            async move { f(ctx, params) }
        })
    }

    /// Tags a method with its own permissions, checked after the
    /// service-level tag. An empty list only requires authentication.
    pub fn require<I, S>(mut self, name: &str, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(entry) = self.methods.get_mut(name) {
            entry.permissions = Some(permissions.into_iter().map(Into::into).collect());
        } else {
            warn!(method = name, "permission tag for unknown method ignored");
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

type Factory = Arc<dyn Fn(&ServiceContext) -> MethodTable + Send + Sync>;

/// A registered service.
#[derive(Clone)]
pub struct ServiceDef {
    pub name: String,
    factory: Factory,
    /// `None`: open to anyone. Empty: any authenticated caller.
    /// Otherwise checked by the registry's [`PermissionPolicy`].
    pub auth_permissions: Option<Vec<String>>,
}

impl ServiceDef {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ServiceContext) -> MethodTable + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(factory),
            auth_permissions: None,
        }
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.auth_permissions = Some(permissions.into_iter().map(Into::into).collect());
        self
    }
}

/// Decides whether granted permissions satisfy a tag.
pub trait PermissionPolicy: Send + Sync {
    fn allows(&self, granted: &Permissions, required: &[String]) -> bool;
}

/// Passes when the caller holds at least one required permission.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyOf;

impl PermissionPolicy for AnyOf {
    fn allows(&self, granted: &Permissions, required: &[String]) -> bool {
        required.iter().any(|p| granted.contains(p))
    }
}

/// Passes when the caller holds every required permission.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllOf;

impl PermissionPolicy for AllOf {
    fn allows(&self, granted: &Permissions, required: &[String]) -> bool {
        required.iter().all(|p| granted.contains(p))
    }
}

/// Registry of services, built at startup and shared by all connections.
pub struct ServiceRegistry {
    services: HashMap<String, ServiceDef>,
    policy: Arc<dyn PermissionPolicy>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: HashMap::new(),
            policy: Arc::new(AnyOf),
        }
    }

    /// Replaces the permission policy.
    pub fn with_policy(mut self, policy: impl PermissionPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Registers a service, replacing any service of the same name.
    pub fn register(&mut self, def: ServiceDef) -> &mut Self {
        if self.services.contains_key(&def.name) {
            warn!(service = %def.name, "replacing registered service");
        }
        self.services.insert(def.name.clone(), def);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn check(
        &self,
        session: &Session,
        required: Option<&[String]>,
        what: &str,
    ) -> Result<(), ServiceError> {
        let Some(required) = required else {
            return Ok(());
        };
        if !session.is_authenticated() {
            return Err(ServiceError::Unauthorized);
        }
        if required.is_empty() || self.policy.allows(session.permissions(), required) {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(format!(
                "permission denied for {what}"
            )))
        }
    }

    /// Resolves and invokes `request.command` for the session.
    pub async fn dispatch(&self, session: &Session, request: Request) -> MethodResult {
        let (service_name, method_name) = request
            .target()
            .ok_or_else(|| ServiceError::BadRequest(format!("invalid command '{}'", request.command)))?;

        let def = self
            .services
            .get(service_name)
            .ok_or_else(|| ServiceError::NotFound(format!("service '{service_name}' not found")))?;
        self.check(session, def.auth_permissions.as_deref(), service_name)?;

        let table = session.method_table(service_name, |ctx| {
            std::panic::catch_unwind(AssertUnwindSafe(|| (def.factory)(ctx))).map_err(panic_error)
        })?;
        let entry = table.methods.get(method_name).ok_or_else(|| {
            ServiceError::NotFound(format!("method '{}' not found", request.command))
        })?;
        self.check(session, entry.permissions.as_deref(), &request.command)?;

        debug!(
            connection = session.id(),
            command = %request.command,
            "dispatching"
        );
        let ctx = CallContext {
            connection: session.context().clone(),
            request_id: request.id,
            url: request.url,
        };
        let handler = entry.handler.clone();
        let params = request.params;

        // A panic may come from building the future or from polling it.
        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(ctx, params))) {
            Ok(future) => future,
            Err(payload) => return Err(panic_error(payload)),
        };
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(panic_error(payload)),
        }
    }
}

fn panic_error(payload: Box<dyn std::any::Any + Send>) -> ServiceError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    warn!(panic = %message, "method panicked");
    ServiceError::Panic(message)
}

/// Returns parameter `index`, or a bad-request error.
pub fn param(params: &[Value], index: usize) -> Result<&Value, ServiceError> {
    params
        .get(index)
        .ok_or_else(|| ServiceError::invalid_params(format!("missing parameter {index}")))
}
