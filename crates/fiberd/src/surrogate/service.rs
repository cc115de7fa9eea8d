//! Services a surrogate can execute.
//!
//! A service is addressed by `serviceComponent.serviceObject` and answers
//! named methods with JSON values. The registry always carries the
//! `Fiber.Diagnostics` service, which the supervisor's watchdog pings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fiber_protocol::ServiceCall;
use serde_json::{json, Value};
use thiserror::Error;

/// Component and object of the built-in diagnostics service.
pub const DIAGNOSTICS_COMPONENT: &str = "Fiber";
pub const DIAGNOSTICS_OBJECT: &str = "Diagnostics";

/// Longest pause `Fiber.Diagnostics.sleep` accepts.
const MAX_SLEEP: Duration = Duration::from_secs(600);

/// Why a service call could not produce a result.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Insufficient data for method invocation")]
    InsufficientData,

    #[error("Couldn't find the specified service object {0}")]
    UnknownObject(String),

    #[error("Couldn't find method {method} in {object}")]
    UnknownMethod { object: String, method: String },

    #[error("Invalid arguments for {method}: {reason}")]
    InvalidArguments { method: String, reason: String },

    #[error("{0}")]
    Failed(String),
}

/// One invokable service object.
#[async_trait]
pub trait Service: Send + Sync {
    async fn invoke(&self, method: &str, args: &[Value]) -> Result<Value, ServiceError>;
}

/// Services keyed by `component.object`.
#[derive(Clone)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<dyn Service>>,
}

impl ServiceRegistry {
    /// A registry holding only `Fiber.Diagnostics`.
    pub fn new() -> Self {
        let mut registry = Self {
            services: HashMap::new(),
        };
        registry.register(DIAGNOSTICS_COMPONENT, DIAGNOSTICS_OBJECT, Diagnostics);
        registry
    }

    /// Adds or replaces a service.
    pub fn register(&mut self, component: &str, object: &str, service: impl Service + 'static) {
        self.services
            .insert(object_path(component, object), Arc::new(service));
    }

    pub fn contains(&self, component: &str, object: &str) -> bool {
        self.services.contains_key(&object_path(component, object))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Runs `call` against the matching service.
    pub async fn invoke(&self, call: &ServiceCall) -> Result<Value, ServiceError> {
        if call.service_component.is_empty()
            || call.service_object.is_empty()
            || call.service_method.is_empty()
        {
            return Err(ServiceError::InsufficientData);
        }

        let path = object_path(&call.service_component, &call.service_object);
        let service = self
            .services
            .get(&path)
            .ok_or_else(|| ServiceError::UnknownObject(format!("Application.{path}")))?;
        service.invoke(&call.service_method, &call.args).await
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn object_path(component: &str, object: &str) -> String {
    format!("{component}.{object}")
}

// ============================================================================
// Fiber.Diagnostics
// ============================================================================

/// Built-in service for liveness checks and testing.
///
/// - `ping()` returns `"pong"`
/// - `echo(args...)` returns its single argument, or all of them as a list
/// - `processId()` returns the surrogate's pid
/// - `sleep(ms)` waits and returns the number of milliseconds slept
#[derive(Debug, Clone, Copy, Default)]
pub struct Diagnostics;

#[async_trait]
impl Service for Diagnostics {
    async fn invoke(&self, method: &str, args: &[Value]) -> Result<Value, ServiceError> {
        match method {
            "ping" => Ok(json!("pong")),
            "echo" => Ok(match args {
                [single] => single.clone(),
                many => Value::Array(many.to_vec()),
            }),
            "processId" => Ok(json!(std::process::id())),
            "sleep" => {
                let ms = args.first().and_then(Value::as_u64).ok_or_else(|| {
                    ServiceError::InvalidArguments {
                        method: method.to_string(),
                        reason: "expected milliseconds".to_string(),
                    }
                })?;
                let pause = Duration::from_millis(ms).min(MAX_SLEEP);
                tokio::time::sleep(pause).await;
                Ok(json!(u64::try_from(pause.as_millis()).unwrap_or(u64::MAX)))
            }
            other => Err(ServiceError::UnknownMethod {
                object: object_path(DIAGNOSTICS_COMPONENT, DIAGNOSTICS_OBJECT),
                method: other.to_string(),
            }),
        }
    }
}
