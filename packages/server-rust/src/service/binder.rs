//! Parameter descriptors and argument binding.
//!
//! Each [`RpcParameter`] records where its value comes from in an HTTP
//! request, its declared type, and which cache-key fragments it provides.
//! Binding turns an inbound HTTP request or a positional RPC argument list
//! into the ordered, type-coerced argument vector handlers receive.
//!
//! Binding is deliberately loose for optional sources: a missing query or
//! header value binds `Null` (or an empty list). A missing path segment or
//! body, or a value that cannot be coerced, fails with [`BindingError`].

use std::collections::BTreeMap;
use std::fmt;

use meridian_core::{tokens_of, CacheKeyFragment, Value};

use crate::service::entry::{DescriptorError, ServiceEntry};
use crate::service::protocol::HttpRequest;

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// Where an HTTP request carries a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterFrom {
    Path,
    Query,
    Body,
    Header,
}

impl fmt::Display for ParameterFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ParameterFrom::Path => "path",
            ParameterFrom::Query => "query",
            ParameterFrom::Body => "body",
            ParameterFrom::Header => "header",
        })
    }
}

/// Declared type of a parameter or property.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterType {
    String,
    Int,
    Float,
    Bool,
    Nullable(Box<ParameterType>),
    List(Box<ParameterType>),
    Complex(ComplexType),
}

impl ParameterType {
    #[must_use]
    pub fn nullable(inner: ParameterType) -> Self {
        ParameterType::Nullable(Box::new(inner))
    }

    #[must_use]
    pub fn list(inner: ParameterType) -> Self {
        ParameterType::List(Box::new(inner))
    }

    /// Scalars, nullable scalars and lists of scalars are "single" types:
    /// they bind from one raw value and provide their own cache-key fragment.
    #[must_use]
    pub fn is_single(&self) -> bool {
        match self {
            ParameterType::String | ParameterType::Int | ParameterType::Float | ParameterType::Bool => true,
            ParameterType::Nullable(inner) | ParameterType::List(inner) => inner.is_single(),
            ParameterType::Complex(_) => false,
        }
    }

    #[must_use]
    pub fn is_nullable(&self) -> bool {
        matches!(self, ParameterType::Nullable(_))
    }

    fn name(&self) -> String {
        match self {
            ParameterType::String => "string".to_string(),
            ParameterType::Int => "int".to_string(),
            ParameterType::Float => "float".to_string(),
            ParameterType::Bool => "bool".to_string(),
            ParameterType::Nullable(inner) => format!("{}?", inner.name()),
            ParameterType::List(inner) => format!("list<{}>", inner.name()),
            ParameterType::Complex(c) => c.name.clone(),
        }
    }

    fn complex(&self) -> Option<&ComplexType> {
        match self {
            ParameterType::Complex(c) => Some(c),
            ParameterType::Nullable(inner) => inner.complex(),
            _ => None,
        }
    }
}

/// A structured parameter type with named properties.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplexType {
    pub name: String,
    pub properties: Vec<PropertyDescriptor>,
}

impl ComplexType {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
        }
    }

    #[must_use]
    pub fn property(mut self, name: impl Into<String>, ty: ParameterType) -> Self {
        self.properties.push(PropertyDescriptor {
            name: name.into(),
            ty,
            cache_key: None,
        });
        self
    }

    /// Adds a property carrying a cache-key attribute at `position`.
    #[must_use]
    pub fn key_property(mut self, name: impl Into<String>, ty: ParameterType, position: usize) -> Self {
        self.properties.push(PropertyDescriptor {
            name: name.into(),
            ty,
            cache_key: Some(position),
        });
        self
    }

    fn find(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .or_else(|| self.properties.iter().find(|p| p.name.eq_ignore_ascii_case(name)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDescriptor {
    pub name: String,
    pub ty: ParameterType,
    /// Position of the cache-key attribute, if the property carries one.
    pub cache_key: Option<usize>,
}

/// How a cache-key provider was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKeySource {
    /// Declared with an explicit attribute.
    Attribute,
    /// Matched by name against a cache-key template token.
    Named,
}

/// Extracts one cache-key fragment from a bound argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeyProvider {
    /// Parameter sample name, or property name for complex parameters.
    pub prop_name: String,
    pub param_index: usize,
    pub position: Option<usize>,
    pub source: CacheKeySource,
}

/// Descriptor of one handler parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcParameter {
    pub from: ParameterFrom,
    /// Declared name, possibly with a `:constraint` suffix.
    pub name: String,
    /// `name` without its constraint suffix.
    pub sample_name: String,
    pub index: usize,
    pub ty: ParameterType,
    pub path_template: Option<String>,
    pub cache_keys: Vec<CacheKeyProvider>,
}

impl RpcParameter {
    #[must_use]
    pub fn builder(name: impl Into<String>, from: ParameterFrom, ty: ParameterType) -> RpcParameterBuilder {
        RpcParameterBuilder {
            name: name.into(),
            from,
            ty,
            index: 0,
            cache_key: None,
            path_template: None,
        }
    }

    #[must_use]
    pub fn is_single_type(&self) -> bool {
        self.ty.is_single()
    }

    /// Resolves this parameter's cache-key fragments from its bound value.
    /// Providers whose source value is absent contribute nothing.
    #[must_use]
    pub fn resolve_cache_keys(&self, value: &Value) -> Vec<CacheKeyFragment> {
        self.cache_keys
            .iter()
            .filter_map(|provider| {
                let source = if self.is_single_type() {
                    Some(value)
                } else {
                    value.field(&provider.prop_name)
                };
                let fragment = source.and_then(Value::to_key_fragment)?;
                Some(CacheKeyFragment {
                    name: provider.prop_name.clone(),
                    value: fragment,
                    position: provider.position,
                })
            })
            .collect()
    }
}

/// Builder for [`RpcParameter`]; cache-key providers resolve at build time
/// against the owning entry's templates.
#[derive(Debug, Clone)]
pub struct RpcParameterBuilder {
    name: String,
    from: ParameterFrom,
    ty: ParameterType,
    index: usize,
    cache_key: Option<usize>,
    path_template: Option<String>,
}

impl RpcParameterBuilder {
    #[must_use]
    pub fn index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    /// Declares a cache-key attribute at `position`. Only valid on single types.
    #[must_use]
    pub fn cache_key(mut self, position: usize) -> Self {
        self.cache_key = Some(position);
        self
    }

    #[must_use]
    pub fn path_template(mut self, template: impl Into<String>) -> Self {
        self.path_template = Some(template.into());
        self
    }

    /// Builds the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError::CacheKeyOnComplexType`] when a cache-key
    /// attribute is declared directly on a complex parameter.
    pub fn build(self, cache_key_templates: &[String]) -> Result<RpcParameter, DescriptorError> {
        let sample_name = self
            .name
            .split(':')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        let single = self.ty.is_single();

        let mut providers: Vec<CacheKeyProvider> = Vec::new();
        if let Some(position) = self.cache_key {
            if !single {
                return Err(DescriptorError::CacheKeyOnComplexType { parameter: self.name });
            }
            providers.push(CacheKeyProvider {
                prop_name: sample_name.clone(),
                param_index: self.index,
                position: Some(position),
                source: CacheKeySource::Attribute,
            });
        } else if let Some(complex) = self.ty.complex() {
            providers.extend(complex.properties.iter().filter_map(|p| {
                p.cache_key.map(|position| CacheKeyProvider {
                    prop_name: p.name.clone(),
                    param_index: self.index,
                    position: Some(position),
                    source: CacheKeySource::Attribute,
                })
            }));
        }

        for token in tokens_of(cache_key_templates) {
            let prop_name = if single {
                sample_name
                    .eq_ignore_ascii_case(&token)
                    .then(|| sample_name.clone())
            } else {
                self.ty
                    .complex()
                    .and_then(|c| c.find(&token))
                    .map(|p| p.name.clone())
            };
            let Some(prop_name) = prop_name else { continue };
            if providers.iter().any(|p| p.prop_name.eq_ignore_ascii_case(&prop_name)) {
                continue;
            }
            providers.push(CacheKeyProvider {
                prop_name,
                param_index: self.index,
                position: None,
                source: CacheKeySource::Named,
            });
        }

        let path_template = match (self.path_template, self.from) {
            (Some(t), _) => Some(t),
            (None, ParameterFrom::Path) => Some(format!("{{{sample_name}}}")),
            (None, _) => None,
        };

        Ok(RpcParameter {
            from: self.from,
            name: self.name,
            sample_name,
            index: self.index,
            ty: self.ty,
            path_template,
            cache_keys: providers,
        })
    }
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

/// Errors raised while binding arguments.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindingError {
    #[error("missing required {from} parameter `{name}`")]
    Missing { name: String, from: ParameterFrom },
    #[error("parameter `{name}` expects {expected}, got `{found}`")]
    Coercion {
        name: String,
        expected: String,
        found: String,
    },
    #[error("expected {expected} arguments, got {found}")]
    Arity { expected: usize, found: usize },
}

impl BindingError {
    /// Name of the offending parameter; empty for arity mismatches.
    #[must_use]
    pub fn member(&self) -> &str {
        match self {
            BindingError::Missing { name, .. } | BindingError::Coercion { name, .. } => name,
            BindingError::Arity { .. } => "",
        }
    }
}

/// Arguments bound for one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundArguments {
    /// One value per parameter, in declared order.
    pub values: Vec<Value>,
    pub cache_keys: Vec<CacheKeyFragment>,
}

impl BoundArguments {
    fn collect(entry: &ServiceEntry, values: Vec<Value>) -> Self {
        let cache_keys = entry
            .parameters
            .iter()
            .zip(&values)
            .flat_map(|(param, value)| param.resolve_cache_keys(value))
            .collect();
        Self { values, cache_keys }
    }

    /// Renders one of the entry's cache-key templates.
    #[must_use]
    pub fn cache_key(&self, template: &str) -> String {
        meridian_core::render_cache_key(template, &self.cache_keys)
    }
}

/// Binds an HTTP request to `entry`'s parameters.
///
/// `path_params` are the raw captures produced by route matching.
///
/// # Errors
///
/// Returns [`BindingError`] for a missing path value or body, or a value
/// that does not coerce to the declared type.
pub fn bind_http(
    entry: &ServiceEntry,
    request: &HttpRequest,
    path_params: &[(String, String)],
) -> Result<BoundArguments, BindingError> {
    let body_params = entry
        .parameters
        .iter()
        .filter(|p| p.from == ParameterFrom::Body)
        .count();

    let mut values = Vec::with_capacity(entry.parameters.len());
    for param in &entry.parameters {
        let value = match param.from {
            ParameterFrom::Path => {
                let raw = path_params
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(&param.sample_name))
                    .map(|(_, v)| v.as_str())
                    .ok_or_else(|| missing(param))?;
                coerce_str(param, raw, &param.ty)?
            }
            ParameterFrom::Query => bind_query(param, request)?,
            ParameterFrom::Header => match request.header(&param.sample_name) {
                Some(raw) => coerce_str(param, raw, &param.ty)?,
                None => missing_optional(&param.ty),
            },
            ParameterFrom::Body => {
                let body = request.body.as_ref().ok_or_else(|| missing(param))?;
                let raw = if body_params == 1 {
                    Value::from(body.clone())
                } else {
                    Value::from(body.clone())
                        .field(&param.sample_name)
                        .cloned()
                        .unwrap_or_default()
                };
                if raw.is_null() && !param.ty.is_nullable() {
                    return Err(missing(param));
                }
                coerce_value(param, raw, &param.ty)?
            }
        };
        values.push(value);
    }
    Ok(BoundArguments::collect(entry, values))
}

/// Binds positional RPC arguments to `entry`'s parameters.
///
/// Trailing nullable parameters may be omitted and bind `Null`.
///
/// # Errors
///
/// Returns [`BindingError::Arity`] for too many or too few arguments, or a
/// coercion error for a value of the wrong type.
pub fn bind_rpc(entry: &ServiceEntry, parameters: Vec<Value>) -> Result<BoundArguments, BindingError> {
    let expected = entry.parameters.len();
    let found = parameters.len();
    let omitted_ok = entry.parameters[found.min(expected)..]
        .iter()
        .all(|p| p.ty.is_nullable());
    if found > expected || !omitted_ok {
        return Err(BindingError::Arity { expected, found });
    }

    let mut supplied = parameters.into_iter();
    let mut values = Vec::with_capacity(expected);
    for param in &entry.parameters {
        let raw = supplied.next().unwrap_or_default();
        values.push(coerce_value(param, raw, &param.ty)?);
    }
    Ok(BoundArguments::collect(entry, values))
}

/// Builds the HTTP request that would bind to `args`. Inverse of [`bind_http`].
///
/// # Errors
///
/// Returns [`BindingError::Arity`] if `args` does not match the entry.
pub fn build_http_request(entry: &ServiceEntry, args: &[Value]) -> Result<HttpRequest, BindingError> {
    if args.len() != entry.parameters.len() {
        return Err(BindingError::Arity {
            expected: entry.parameters.len(),
            found: args.len(),
        });
    }

    let body_params = entry
        .parameters
        .iter()
        .filter(|p| p.from == ParameterFrom::Body)
        .count();
    let mut path_values = Vec::new();
    let mut request = HttpRequest::new(entry.method, "/");
    let mut body = serde_json::Map::new();

    for (param, value) in entry.parameters.iter().zip(args) {
        match param.from {
            ParameterFrom::Path => {
                if let Some(fragment) = value.to_key_fragment() {
                    path_values.push((param.sample_name.clone(), fragment));
                }
            }
            ParameterFrom::Query => match value {
                Value::Array(items) => {
                    for item in items {
                        if let Some(fragment) = item.to_key_fragment() {
                            request.query.push((param.sample_name.clone(), fragment));
                        }
                    }
                }
                Value::Map(fields) => {
                    for (name, field) in fields {
                        if let Some(fragment) = field.to_key_fragment() {
                            request.query.push((name.clone(), fragment));
                        }
                    }
                }
                other => {
                    if let Some(fragment) = other.to_key_fragment() {
                        request.query.push((param.sample_name.clone(), fragment));
                    }
                }
            },
            ParameterFrom::Header => {
                if let Some(fragment) = value.to_key_fragment() {
                    request.headers.push((param.sample_name.clone(), fragment));
                }
            }
            ParameterFrom::Body => {
                if body_params == 1 {
                    request.body = Some(value.to_json());
                } else {
                    body.insert(param.sample_name.clone(), value.to_json());
                }
            }
        }
    }

    if body_params > 1 {
        request.body = Some(serde_json::Value::Object(body));
    }
    request.path = entry.route.render(&path_values);
    Ok(request)
}

// ---------------------------------------------------------------------------
// Coercion
// ---------------------------------------------------------------------------

fn missing(param: &RpcParameter) -> BindingError {
    BindingError::Missing {
        name: param.sample_name.clone(),
        from: param.from,
    }
}

fn missing_optional(ty: &ParameterType) -> Value {
    match ty {
        ParameterType::List(_) => Value::Array(Vec::new()),
        _ => Value::Null,
    }
}

fn mismatch(param: &RpcParameter, ty: &ParameterType, found: impl fmt::Debug) -> BindingError {
    BindingError::Coercion {
        name: param.sample_name.clone(),
        expected: ty.name(),
        found: format!("{found:?}"),
    }
}

fn bind_query(param: &RpcParameter, request: &HttpRequest) -> Result<Value, BindingError> {
    if let Some(complex) = param.ty.complex() {
        let fields: BTreeMap<String, Value> = complex
            .properties
            .iter()
            .filter_map(|p| {
                request
                    .query_values(&p.name)
                    .first()
                    .map(|raw| (p.name.clone(), Value::from(*raw)))
            })
            .collect();
        if fields.is_empty() {
            return Ok(missing_optional(&param.ty));
        }
        return coerce_value(param, Value::Map(fields), &param.ty);
    }

    let raws = request.query_values(&param.sample_name);
    match &param.ty {
        ParameterType::List(inner) => raws
            .iter()
            .flat_map(|raw| raw.split(','))
            .filter(|s| !s.is_empty())
            .map(|raw| coerce_str(param, raw, inner))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        ty => match raws.first() {
            Some(raw) => coerce_str(param, raw, ty),
            None => Ok(missing_optional(ty)),
        },
    }
}

fn coerce_str(param: &RpcParameter, raw: &str, ty: &ParameterType) -> Result<Value, BindingError> {
    match ty {
        ParameterType::String => Ok(Value::String(raw.to_string())),
        ParameterType::Int => raw.trim().parse::<i64>().map(Value::Int).map_err(|_| mismatch(param, ty, raw)),
        ParameterType::Float => raw
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| mismatch(param, ty, raw)),
        ParameterType::Bool => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(mismatch(param, ty, raw)),
        },
        ParameterType::Nullable(inner) => {
            if raw.is_empty() {
                Ok(Value::Null)
            } else {
                coerce_str(param, raw, inner)
            }
        }
        ParameterType::List(inner) => raw
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|part| coerce_str(param, part, inner))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        ParameterType::Complex(_) => Err(mismatch(param, ty, raw)),
    }
}

fn coerce_value(param: &RpcParameter, value: Value, ty: &ParameterType) -> Result<Value, BindingError> {
    match (ty, value) {
        (ParameterType::Nullable(_), Value::Null) => Ok(Value::Null),
        (ParameterType::Nullable(inner), value) => coerce_value(param, value, inner),
        (_, Value::String(s)) if !matches!(ty, ParameterType::String) => coerce_str(param, &s, ty),
        (ParameterType::String, Value::String(s)) => Ok(Value::String(s)),
        (ParameterType::String, value @ (Value::Int(_) | Value::Float(_) | Value::Bool(_))) => {
            Ok(Value::String(value.to_key_fragment().unwrap_or_default()))
        }
        (ParameterType::Int, Value::Int(i)) => Ok(Value::Int(i)),
        #[allow(clippy::cast_possible_truncation)]
        (ParameterType::Int, Value::Float(f)) if f.fract() == 0.0 && f.is_finite() => Ok(Value::Int(f as i64)),
        #[allow(clippy::cast_precision_loss)]
        (ParameterType::Float, Value::Int(i)) => Ok(Value::Float(i as f64)),
        (ParameterType::Float, Value::Float(f)) => Ok(Value::Float(f)),
        (ParameterType::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
        (ParameterType::List(inner), Value::Array(items)) => items
            .into_iter()
            .map(|item| coerce_value(param, item, inner))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        (ParameterType::List(_), Value::Null) => Ok(Value::Array(Vec::new())),
        (ParameterType::List(inner), single) => Ok(Value::Array(vec![coerce_value(param, single, inner)?])),
        (ParameterType::Complex(complex), Value::Map(fields)) => {
            let mut bound = BTreeMap::new();
            for prop in &complex.properties {
                let raw = fields
                    .get(&prop.name)
                    .or_else(|| {
                        fields
                            .iter()
                            .find(|(k, _)| k.eq_ignore_ascii_case(&prop.name))
                            .map(|(_, v)| v)
                    })
                    .cloned()
                    .unwrap_or_default();
                let value = if raw.is_null() {
                    missing_optional(&prop.ty)
                } else {
                    coerce_value(param, raw, &prop.ty)?
                };
                bound.insert(prop.name.clone(), value);
            }
            Ok(Value::Map(bound))
        }
        (ty, value) => Err(mismatch(param, ty, value)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
