//! Storage key schema.
//!
//! An [`OperationNamespace`] is a pure value: it maps `(application,
//! operation_id)` to the keys of the operation's status, heartbeat, results
//! and cancel mappings, plus the application-scoped stream, consumer group and
//! liveness key. Two different operations never share a key.

use std::fmt;

use uuid::Uuid;

use crate::error::{Error, Result};

const SEPARATOR: char = ':';

/// Generates a fresh identifier: a random UUIDv4 in simple hex form.
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Checks that `component` can be embedded in a storage key.
///
/// # Errors
///
/// Returns [`Error::InvalidNamespace`] for empty values, values containing
/// `:` and values containing whitespace or control characters.
pub fn validate_component(component: &str) -> Result<()> {
    let reason = if component.is_empty() {
        "must not be empty"
    } else if component.contains(SEPARATOR) {
        "must not contain ':'"
    } else if component.chars().any(|c| c.is_whitespace() || c.is_control()) {
        "must not contain whitespace or control characters"
    } else {
        return Ok(());
    };
    Err(Error::InvalidNamespace {
        component: component.to_string(),
        reason,
    })
}

/// Application-scoped keys shared by every operation of one application.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Application {
    name: String,
}

impl Application {
    /// Creates an application scope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidNamespace`] if `name` is not a valid key
    /// component.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_component(&name)?;
        Ok(Self { name })
    }

    /// Application name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stream every task of the application is published to.
    pub fn stream(&self) -> String {
        format!("{}:tasks", self.name)
    }

    /// Consumer group all workers of the application join.
    pub fn group(&self) -> String {
        format!("{}:workers", self.name)
    }

    /// Worker liveness mapping (one field per worker id).
    pub fn listeners_key(&self) -> String {
        format!("{}:listeners", self.name)
    }

    /// Namespace of a specific operation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidNamespace`] if `operation_id` is not a valid
    /// key component.
    pub fn operation(&self, operation_id: impl Into<String>) -> Result<OperationNamespace> {
        let operation_id = operation_id.into();
        validate_component(&operation_id)?;
        Ok(OperationNamespace {
            application: self.clone(),
            operation_id,
        })
    }

    /// Namespace of a new operation with a random id.
    pub fn new_operation(&self) -> OperationNamespace {
        OperationNamespace {
            application: self.clone(),
            operation_id: new_id(),
        }
    }
}

impl fmt::Display for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Keys of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationNamespace {
    application: Application,
    operation_id: String,
}

impl OperationNamespace {
    /// Convenience constructor validating both components.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidNamespace`] if either component is invalid.
    pub fn new(application: impl Into<String>, operation_id: impl Into<String>) -> Result<Self> {
        Application::new(application)?.operation(operation_id)
    }

    /// Owning application.
    pub fn application(&self) -> &Application {
        &self.application
    }

    /// Operation id.
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// `task_id -> status code` mapping.
    pub fn status_key(&self) -> String {
        self.key("status")
    }

    /// `task_id -> last heartbeat` mapping.
    pub fn heartbeat_key(&self) -> String {
        self.key("heartbeat")
    }

    /// `task_id -> result bytes` mapping.
    pub fn results_key(&self) -> String {
        self.key("results")
    }

    /// Cancellation marker of the operation.
    pub fn cancel_key(&self) -> String {
        self.key("cancel")
    }

    /// Every per-operation key, in deletion order.
    pub fn operation_keys(&self) -> [String; 4] {
        [
            self.status_key(),
            self.heartbeat_key(),
            self.results_key(),
            self.cancel_key(),
        ]
    }

    fn key(&self, suffix: &str) -> String {
        format!(
            "{}{SEPARATOR}{}{SEPARATOR}{suffix}",
            self.application.name, self.operation_id
        )
    }
}

impl fmt::Display for OperationNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.application.name, self.operation_id)
    }
}
