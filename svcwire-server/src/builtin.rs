//! Built-in services.
//!
//! `Echo` is a small diagnostic service used by the CLI and tests.
//! `DbProxy` exposes the resource proxy table to clients; it is only
//! registered when a resource driver is configured.

use crate::service::{param, CallContext, MethodTable, ServiceDef, ServiceError, ServiceRegistry};
use std::time::Duration;
use svcwire_protocol::Value;

/// Service name of the resource proxy.
pub const RESOURCE_SERVICE: &str = "DbProxy";

/// Longest delay `Echo.sleep` accepts.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// Registers the built-in services.
pub fn register(registry: &mut ServiceRegistry, with_resources: bool) {
    registry.register(echo_service());
    if with_resources {
        registry.register(resource_service());
    }
}

pub fn echo_service() -> ServiceDef {
    ServiceDef::new("Echo", |_ctx| {
        MethodTable::new()
            .sync_method("echo", |_, params| {
                Ok(params.into_iter().next().unwrap_or_default())
            })
            .sync_method("add", |_, params| add(&params))
            .method("sleep", |_, params| async move {
                let ms = param(&params, 0)?
                    .as_u64()
                    .ok_or_else(|| ServiceError::invalid_params("sleep expects milliseconds"))?;
                let delay = Duration::from_millis(ms).min(MAX_SLEEP);
                tokio::time::sleep(delay).await;
                Ok(Value::from(delay.as_millis() as u64))
            })
    })
}

/// Sums numbers exactly while they are all integers.
fn add(params: &[Value]) -> Result<Value, ServiceError> {
    let mut int_sum = Some(0i64);
    let mut float_sum = 0f64;
    for p in params {
        let Value::Number(n) = p else {
            return Err(ServiceError::invalid_params(format!(
                "add expects numbers, got {}",
                p.kind()
            )));
        };
        if n.is_f64() {
            int_sum = None;
        } else if let Some(sum) = int_sum {
            let n = n
                .as_i64()
                .ok_or_else(|| ServiceError::invalid_params("add operand out of range"))?;
            int_sum = Some(
                sum.checked_add(n)
                    .ok_or_else(|| ServiceError::invalid_params("add overflowed"))?,
            );
        }
        float_sum += n.as_f64().unwrap_or_default();
    }
    Ok(match int_sum {
        Some(sum) => Value::from(sum),
        None => Value::from(float_sum),
    })
}

fn session_id(params: &[Value]) -> Result<u64, ServiceError> {
    param(params, 0)?
        .as_u64()
        .ok_or_else(|| ServiceError::invalid_params("expected a resource session id"))
}

/// The resource proxy: `open(config) -> id`, then `execute`, `begin`,
/// `commit`, `rollback` and `close` on that id.
pub fn resource_service() -> ServiceDef {
    ServiceDef::new(RESOURCE_SERVICE, |_ctx| {
        MethodTable::new()
            .method("open", |ctx: CallContext, params| async move {
                let config = params.into_iter().next().unwrap_or_default();
                let id = ctx.resources().open(ctx.connection_id(), &config).await?;
                Ok(Value::from(id))
            })
            .method("execute", |ctx: CallContext, params| async move {
                let id = session_id(&params)?;
                let payload = params.get(1).cloned().unwrap_or_default();
                Ok(ctx.resources().execute(ctx.connection_id(), id, payload).await?)
            })
            .method("begin", |ctx: CallContext, params| async move {
                let id = session_id(&params)?;
                ctx.resources().begin(ctx.connection_id(), id).await?;
                Ok(Value::Null)
            })
            .method("commit", |ctx: CallContext, params| async move {
                let id = session_id(&params)?;
                ctx.resources().commit(ctx.connection_id(), id).await?;
                Ok(Value::Null)
            })
            .method("rollback", |ctx: CallContext, params| async move {
                let id = session_id(&params)?;
                ctx.resources().rollback(ctx.connection_id(), id).await?;
                Ok(Value::Null)
            })
            .method("close", |ctx: CallContext, params| async move {
                let id = session_id(&params)?;
                ctx.resources().close(ctx.connection_id(), id).await?;
                Ok(Value::Null)
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventRegistry;
    use crate::resource::{MemoryDriver, ResourceTable};
    use crate::session::{Identity, Session};
    use std::sync::Arc;
    use svcwire_protocol::message::Request;
    use svcwire_protocol::ErrorCode;

    fn setup() -> (ServiceRegistry, Session) {
        let mut registry = ServiceRegistry::new();
        register(&mut registry, true);
        let session = Session::new(
            "127.0.0.1:1".parse().unwrap(),
            Identity {
                connection_id: 3,
                client_id: "c".into(),
                client_name: None,
                authenticated: false,
                permissions: Default::default(),
            },
            Arc::new(EventRegistry::new()),
            Arc::new(ResourceTable::new(Some(Arc::new(MemoryDriver::new())))),
        );
        (registry, session)
    }

    async fn call(
        registry: &ServiceRegistry,
        session: &Session,
        command: &str,
        params: Vec<Value>,
    ) -> Result<Value, ServiceError> {
        registry
            .dispatch(session, Request::new(1, command).with_params(params))
            .await
    }

    #[test]
    fn test_resource_service_is_optional() {
        let mut registry = ServiceRegistry::new();
        register(&mut registry, false);
        assert_eq!(registry.names(), vec!["Echo"]);
    }

    #[tokio::test]
    async fn test_echo_methods() {
        let (registry, session) = setup();
        assert_eq!(
            call(&registry, &session, "Echo.add", vec![1.into(), 2.into()])
                .await
                .unwrap(),
            Value::from(3)
        );
        assert_eq!(
            call(&registry, &session, "Echo.add", vec![1.into(), 0.5.into()])
                .await
                .unwrap(),
            Value::from(1.5)
        );
        let err = call(&registry, &session, "Echo.add", vec!["x".into()])
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::BadRequest);
        assert_eq!(
            call(&registry, &session, "Echo.sleep", vec![5.into()])
                .await
                .unwrap(),
            Value::from(5u64)
        );
    }

    #[tokio::test]
    async fn test_add_keeps_large_integers_exact() {
        let (registry, session) = setup();
        let big = 9_007_199_254_740_993i64;
        assert_eq!(
            call(&registry, &session, "Echo.add", vec![big.into(), 1.into()])
                .await
                .unwrap(),
            Value::from(big + 1)
        );

        let err = call(&registry, &session, "Echo.add", vec![i64::MAX.into(), 1.into()])
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::BadRequest);

        let err = call(&registry, &session, "Echo.add", vec![u64::MAX.into()])
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::BadRequest);

        assert_eq!(
            call(&registry, &session, "Echo.add", vec![]).await.unwrap(),
            Value::from(0)
        );
    }

    #[tokio::test]
    async fn test_resource_round_trip() {
        let (registry, session) = setup();
        let id = call(&registry, &session, "DbProxy.open", vec![])
            .await
            .unwrap()
            .as_u64()
            .unwrap();

        call(&registry, &session, "DbProxy.begin", vec![id.into()])
            .await
            .unwrap();
        let set = Value::object([
            ("op", Value::from("set")),
            ("key", Value::from("a")),
            ("value", Value::from(1)),
        ]);
        call(&registry, &session, "DbProxy.execute", vec![id.into(), set])
            .await
            .unwrap();
        call(&registry, &session, "DbProxy.commit", vec![id.into()])
            .await
            .unwrap();

        let get = Value::object([("op", "get"), ("key", "a")]);
        let rows = call(&registry, &session, "DbProxy.execute", vec![id.into(), get])
            .await
            .unwrap();
        assert_eq!(rows.as_array().map(Vec::len), Some(1));

        call(&registry, &session, "DbProxy.close", vec![id.into()])
            .await
            .unwrap();
        let err = call(&registry, &session, "DbProxy.begin", vec![id.into()])
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ResourceNotFound);
    }
}
