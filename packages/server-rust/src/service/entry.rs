//! Service entries: the unit of routing and dispatch.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::service::binder::{RpcParameter, RpcParameterBuilder};
use crate::service::handler::ServiceHandler;
use crate::service::route::RouteTemplate;

/// Errors detected while building an entry or its parameter descriptors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("invalid route template `{template}`: {reason}")]
    InvalidRoute { template: String, reason: String },
    #[error("parameter `{parameter}` is a complex type and cannot carry a cache-key attribute")]
    CacheKeyOnComplexType { parameter: String },
    #[error("entry `{entry}` has no handler")]
    MissingHandler { entry: String },
    #[error("entry `{entry}` declares path parameter `{parameter}` missing from its route")]
    UnknownPathParameter { entry: String, parameter: String },
}

/// HTTP verbs a service entry can be exposed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        })
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(format!("unsupported http method: {other}")),
        }
    }
}

/// Protocol tag selecting which inbound handlers may serve the entry.
///
/// `Rpc` entries are served to both the gateway and RPC peers, `Http`
/// entries only through the gateway. `Ws` entries are served by a websocket
/// upgrade outside the dispatch pipeline, so neither handler engages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceProtocol {
    Http,
    #[default]
    Rpc,
    Ws,
}

impl ServiceProtocol {
    #[must_use]
    pub fn serves_http(self) -> bool {
        matches!(self, ServiceProtocol::Http | ServiceProtocol::Rpc)
    }

    #[must_use]
    pub fn serves_rpc(self) -> bool {
        self == ServiceProtocol::Rpc
    }
}

/// Per-entry governance switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernanceOptions {
    /// Hide the entry from the external (gateway) route table.
    pub prohibit_extranet: bool,
    pub allow_anonymous: bool,
    /// Roles allowed to call the entry. Empty means any authenticated caller.
    pub authorize_roles: Vec<String>,
    /// Execution timeout override, in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Concurrent executions allowed for this entry on one node, on top of
    /// the node-wide cap.
    pub max_concurrency: Option<u32>,
}

impl Default for GovernanceOptions {
    fn default() -> Self {
        Self {
            prohibit_extranet: false,
            allow_anonymous: true,
            authorize_roles: Vec::new(),
            timeout_ms: None,
            max_concurrency: None,
        }
    }
}

/// Names the confirm and cancel entries of a TCC try entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TccMethods {
    pub confirm_entry_id: String,
    pub cancel_entry_id: String,
}

/// A routable, dispatchable unit.
///
/// Immutable once registered; the registry hands out `Arc<ServiceEntry>`.
#[derive(Clone)]
pub struct ServiceEntry {
    pub id: String,
    pub method: HttpMethod,
    pub route: RouteTemplate,
    pub protocol: ServiceProtocol,
    pub governance: GovernanceOptions,
    /// Parameter descriptors ordered by declared index.
    pub parameters: Vec<RpcParameter>,
    pub cache_key_templates: Vec<String>,
    pub tcc: Option<TccMethods>,
    pub handler: Arc<dyn ServiceHandler>,
}

impl fmt::Debug for ServiceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceEntry")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("route", &self.route.as_str())
            .field("protocol", &self.protocol)
            .field("governance", &self.governance)
            .field("parameters", &self.parameters.len())
            .field("tcc", &self.tcc)
            .finish_non_exhaustive()
    }
}

impl ServiceEntry {
    #[must_use]
    pub fn builder(id: impl Into<String>, method: HttpMethod, route: impl Into<String>) -> ServiceEntryBuilder {
        ServiceEntryBuilder {
            id: id.into(),
            method,
            route: route.into(),
            protocol: ServiceProtocol::Rpc,
            governance: GovernanceOptions::default(),
            parameters: Vec::new(),
            cache_key_templates: Vec::new(),
            tcc: None,
            handler: None,
        }
    }

    /// Whether the gateway may route external requests to this entry.
    #[must_use]
    pub fn is_external(&self) -> bool {
        !self.governance.prohibit_extranet
    }
}

/// Builder for [`ServiceEntry`].
pub struct ServiceEntryBuilder {
    id: String,
    method: HttpMethod,
    route: String,
    protocol: ServiceProtocol,
    governance: GovernanceOptions,
    parameters: Vec<RpcParameterBuilder>,
    cache_key_templates: Vec<String>,
    tcc: Option<TccMethods>,
    handler: Option<Arc<dyn ServiceHandler>>,
}

impl ServiceEntryBuilder {
    /// Appends a parameter; its index is its position among appended parameters.
    #[must_use]
    pub fn param(mut self, parameter: RpcParameterBuilder) -> Self {
        self.parameters.push(parameter);
        self
    }

    #[must_use]
    pub fn cache_key_template(mut self, template: impl Into<String>) -> Self {
        self.cache_key_templates.push(template.into());
        self
    }

    #[must_use]
    pub fn protocol(mut self, protocol: ServiceProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    #[must_use]
    pub fn prohibit_extranet(mut self) -> Self {
        self.governance.prohibit_extranet = true;
        self
    }

    #[must_use]
    pub fn authorize_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.governance.allow_anonymous = false;
        self.governance.authorize_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.governance.timeout_ms = Some(timeout_ms);
        self
    }

    #[must_use]
    pub fn max_concurrency(mut self, limit: u32) -> Self {
        self.governance.max_concurrency = Some(limit);
        self
    }

    /// Marks the entry as a TCC try method with its confirm and cancel entries.
    #[must_use]
    pub fn tcc(mut self, confirm_entry_id: impl Into<String>, cancel_entry_id: impl Into<String>) -> Self {
        self.tcc = Some(TccMethods {
            confirm_entry_id: confirm_entry_id.into(),
            cancel_entry_id: cancel_entry_id.into(),
        });
        self
    }

    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn ServiceHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Builds the entry, resolving every parameter's cache-key providers.
    ///
    /// # Errors
    ///
    /// Returns a [`DescriptorError`] for an invalid route, a missing handler,
    /// a path parameter absent from the route, or a cache-key attribute on a
    /// complex parameter.
    pub fn build(self) -> Result<ServiceEntry, DescriptorError> {
        let route = RouteTemplate::parse(&self.route)?;
        let handler = self.handler.ok_or_else(|| DescriptorError::MissingHandler {
            entry: self.id.clone(),
        })?;

        let mut parameters = Vec::with_capacity(self.parameters.len());
        for (index, builder) in self.parameters.into_iter().enumerate() {
            let parameter = builder.index(index).build(&self.cache_key_templates)?;
            if parameter.from == crate::service::binder::ParameterFrom::Path
                && !route
                    .param_names()
                    .any(|n| n.eq_ignore_ascii_case(&parameter.sample_name))
            {
                return Err(DescriptorError::UnknownPathParameter {
                    entry: self.id.clone(),
                    parameter: parameter.name.clone(),
                });
            }
            parameters.push(parameter);
        }

        Ok(ServiceEntry {
            id: self.id,
            method: self.method,
            route,
            protocol: self.protocol,
            governance: self.governance,
            parameters,
            cache_key_templates: self.cache_key_templates,
            tcc: self.tcc,
            handler,
        })
    }
}
