//! Topic bindings and the lookup table the dispatcher routes through
//!
//! The table is filled at startup and read-only afterwards.

use super::handler::CommandHandler;
use crate::protocol::{inbound_topic, namespaced_topic, validate_base_topic, TopicError};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// How invocations of one binding are scheduled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InvocationMode {
    /// One task per message; completion order is not guaranteed
    #[default]
    Concurrent,
    /// One FIFO worker; invocations start and finish in delivery order
    Sequential,
}

/// Binding registration errors
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("Invalid base topic: {0}")]
    InvalidTopic(#[from] TopicError),
    #[error("Topic {topic} collides with an existing binding for {existing}")]
    TopicCollision { topic: String, existing: String },
}

/// Inbound topic, response topic and the handler serving them
#[derive(Clone)]
pub struct TopicBinding {
    /// Base topic the capability was registered with
    pub base: String,
    pub inbound: String,
    pub response: String,
    pub handler: Arc<dyn CommandHandler>,
    pub retain: bool,
    pub mode: InvocationMode,
}

impl fmt::Debug for TopicBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicBinding")
            .field("inbound", &self.inbound)
            .field("response", &self.response)
            .field("handler", &self.handler.name())
            .field("retain", &self.retain)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Lookup table from inbound topic to binding
#[derive(Debug, Default)]
pub struct TopicRegistry {
    namespace: Option<String>,
    bindings: HashMap<String, Arc<TopicBinding>>,
    /// Inbound topics in registration order
    order: Vec<String>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also serve every capability under `<namespace><base>`
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Bind `<base>/post` to `handler`, answering on `<base>`
    ///
    /// With a namespace the capability is bound a second time on
    /// `<ns><base>/post`, answering on `<ns><base>`. Nothing is registered
    /// unless every topic pair is free.
    pub fn register(
        &mut self,
        base: &str,
        handler: Arc<dyn CommandHandler>,
        retain: bool,
        mode: InvocationMode,
    ) -> Result<(), RegistryError> {
        validate_base_topic(base)?;

        let mut pairs = vec![(inbound_topic(base), base.to_string())];
        if let Some(namespace) = &self.namespace {
            let scoped = namespaced_topic(namespace, base);
            pairs.push((inbound_topic(&scoped), scoped));
        }

        for (inbound, response) in &pairs {
            self.check_collision(inbound, response)?;
        }

        for (inbound, response) in pairs {
            let binding = TopicBinding {
                base: base.to_string(),
                inbound: inbound.clone(),
                response,
                handler: handler.clone(),
                retain,
                mode,
            };
            self.order.push(inbound.clone());
            self.bindings.insert(inbound, Arc::new(binding));
        }

        Ok(())
    }

    fn check_collision(&self, inbound: &str, response: &str) -> Result<(), RegistryError> {
        for existing in self.bindings.values() {
            let collides = existing.inbound == inbound
                || existing.inbound == response
                || existing.response == inbound;
            if collides {
                let topic = if existing.inbound == response {
                    response
                } else {
                    inbound
                };
                return Err(RegistryError::TopicCollision {
                    topic: topic.to_string(),
                    existing: existing.inbound.clone(),
                });
            }
        }
        Ok(())
    }

    /// Binding for an inbound topic (exact match)
    pub fn lookup(&self, topic: &str) -> Option<Arc<TopicBinding>> {
        self.bindings.get(topic).cloned()
    }

    /// Every topic the session must subscribe
    pub fn inbound_topics(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Bindings in registration order
    pub fn bindings(&self) -> impl Iterator<Item = &Arc<TopicBinding>> {
        self.order.iter().filter_map(|topic| self.bindings.get(topic))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
