//! Capability-based dependency resolution between rules
//!
//! Each module owns a [`DependencyProvider`] built during its
//! `DependencyInjection` phase. Providers are chained to the provider of the
//! parent module, and a separate root provider holds process-wide services.

use serde::Serialize;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use tracing::debug;

use crate::error::{DependencyError, ValidationError};
use crate::rules::short_type_name;

/// Where a dependency is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DependencySource {
    /// The requesting module only.
    Module,
    /// The requesting module, then each ancestor module up to the root.
    Related,
    /// The process-wide service scope.
    Service,
}

impl fmt::Display for DependencySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DependencySource::Module => "module",
            DependencySource::Related => "related",
            DependencySource::Service => "service",
        };
        write!(f, "{}", label)
    }
}

struct Capability {
    provider: String,
    name: &'static str,
    value: Box<dyn Any>,
}

/// Capabilities offered within one scope, linked to an optional parent scope.
pub struct DependencyProvider {
    scope: String,
    capabilities: HashMap<TypeId, Capability>,
    by_provider: HashMap<String, &'static str>,
    parent: Option<Rc<DependencyProvider>>,
}

impl DependencyProvider {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            capabilities: HashMap::new(),
            by_provider: HashMap::new(),
            parent: None,
        }
    }

    pub fn with_parent(scope: impl Into<String>, parent: Option<Rc<DependencyProvider>>) -> Self {
        Self {
            parent,
            ..Self::new(scope)
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn parent(&self) -> Option<&Rc<DependencyProvider>> {
        self.parent.as_ref()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Register `value` as capability `C`, provided by `provider`.
    ///
    /// A capability may be provided once per scope, and a provider may offer
    /// only one capability.
    pub fn register<C: ?Sized + 'static>(
        &mut self,
        provider: &str,
        value: Rc<C>,
    ) -> Result<(), ValidationError> {
        let name = short_type_name(std::any::type_name::<C>());

        if let Some(existing) = self.capabilities.get(&TypeId::of::<C>()) {
            return Err(ValidationError::DuplicateProvider {
                capability: name.to_string(),
                existing: existing.provider.clone(),
            });
        }
        if let Some(existing) = self.by_provider.get(provider) {
            return Err(ValidationError::MultipleCapabilities {
                rule: provider.to_string(),
                existing: existing.to_string(),
                capability: name.to_string(),
            });
        }

        debug!(scope = %self.scope, capability = name, provider = provider, "Capability registered");
        self.by_provider.insert(provider.to_string(), name);
        self.capabilities.insert(
            TypeId::of::<C>(),
            Capability {
                provider: provider.to_string(),
                name,
                value: Box::new(value),
            },
        );
        Ok(())
    }

    /// Capability `C` from this scope only.
    pub fn get_local<C: ?Sized + 'static>(&self) -> Option<Rc<C>> {
        self.capabilities
            .get(&TypeId::of::<C>())
            .and_then(|cap| cap.value.downcast_ref::<Rc<C>>())
            .cloned()
    }

    /// Capability `C` from this scope, then each ancestor in turn.
    pub fn resolve<C: ?Sized + 'static>(&self) -> Option<Rc<C>> {
        let mut scope = Some(self);
        while let Some(provider) = scope {
            if let Some(found) = provider.get_local::<C>() {
                return Some(found);
            }
            scope = provider.parent.as_deref();
        }
        None
    }

    pub fn provider_of<C: ?Sized + 'static>(&self) -> Option<&str> {
        self.capabilities
            .get(&TypeId::of::<C>())
            .map(|cap| cap.provider.as_str())
    }

    /// Capability names registered in this scope.
    pub fn capability_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.capabilities.values().map(|cap| cap.name).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for DependencyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyProvider")
            .field("scope", &self.scope)
            .field("capabilities", &self.capability_names())
            .field("parent", &self.parent.as_ref().map(|p| p.scope.clone()))
            .finish()
    }
}

/// Registration handle given to one rule while providers are collected.
pub struct CapabilityRegistry<'a> {
    provider: &'a mut DependencyProvider,
    rule: &'a str,
}

impl<'a> CapabilityRegistry<'a> {
    pub fn new(provider: &'a mut DependencyProvider, rule: &'a str) -> Self {
        Self { provider, rule }
    }

    pub fn provide<C: ?Sized + 'static>(&mut self, value: Rc<C>) -> Result<(), ValidationError> {
        self.provider.register(self.rule, value)
    }
}

/// Lookup handle given to one rule while its dependencies are injected.
pub struct Injector<'a> {
    dependent: &'a str,
    module: &'a DependencyProvider,
    services: Option<&'a DependencyProvider>,
}

impl<'a> Injector<'a> {
    pub fn new(
        dependent: &'a str,
        module: &'a DependencyProvider,
        services: Option<&'a DependencyProvider>,
    ) -> Self {
        Self {
            dependent,
            module,
            services,
        }
    }

    pub fn optional<C: ?Sized + 'static>(&self, source: DependencySource) -> Option<Rc<C>> {
        match source {
            DependencySource::Module => self.module.get_local::<C>(),
            DependencySource::Related => self.module.resolve::<C>(),
            DependencySource::Service => self.services.and_then(|s| s.get_local::<C>()),
        }
    }

    pub fn require<C: ?Sized + 'static>(
        &self,
        source: DependencySource,
    ) -> Result<Rc<C>, DependencyError> {
        self.optional::<C>(source).ok_or_else(|| DependencyError {
            dependent: self.dependent.to_string(),
            capability: short_type_name(std::any::type_name::<C>()).to_string(),
            scope: source,
        })
    }
}
