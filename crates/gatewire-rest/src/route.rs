//! Route templates and their compiled, concrete form.
//!
//! A [`Route`] is an immutable template such as
//! `POST /channels/{channel}/messages`. Compiling it with path parameters
//! yields a [`CompiledRoute`], which knows its concrete path and the value
//! of its major parameter. Requests to the same template and the same major
//! parameter share a rate-limit bucket, even before the service has told us
//! the bucket hash.

use std::fmt;
use std::sync::Arc;

use crate::error::{RestError, Result};

/// Path parameters that select a distinct rate-limit bucket, in priority order.
pub const MAJOR_PARAMS: [&str; 3] = ["channel", "guild", "webhook"];

/// Major parameter value used when a template has none.
const NO_MAJOR: &str = "-";

/// HTTP method of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
}

impl Method {
    /// Upper-case method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for http::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => http::Method::GET,
            Method::Post => http::Method::POST,
            Method::Put => http::Method::PUT,
            Method::Patch => http::Method::PATCH,
            Method::Delete => http::Method::DELETE,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct RouteInner {
    method: Method,
    template: String,
    params: Vec<String>,
    major_param: Option<String>,
}

/// An immutable route template. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    inner: Arc<RouteInner>,
}

impl Route {
    /// Creates a route, auto-detecting the major parameter.
    pub fn new(method: Method, template: impl Into<String>) -> Self {
        let template = template.into();
        let params = parse_params(&template);
        let major_param = MAJOR_PARAMS
            .iter()
            .find(|major| params.iter().any(|p| p == *major))
            .map(|major| major.to_string());
        Self::build(method, template, params, major_param)
    }

    /// Creates a route with an explicit major parameter, or none.
    pub fn with_major(method: Method, template: impl Into<String>, major: Option<&str>) -> Self {
        let template = template.into();
        let params = parse_params(&template);
        Self::build(method, template, params, major.map(str::to_string))
    }

    fn build(
        method: Method,
        template: String,
        params: Vec<String>,
        major_param: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(RouteInner {
                method,
                template,
                params,
                major_param,
            }),
        }
    }

    /// HTTP method.
    pub fn method(&self) -> Method {
        self.inner.method
    }

    /// Path template.
    pub fn template(&self) -> &str {
        &self.inner.template
    }

    /// Names of the `{param}` placeholders, in order of appearance.
    pub fn params(&self) -> &[String] {
        &self.inner.params
    }

    /// Name of the major parameter, if the template has one.
    pub fn major_param(&self) -> Option<&str> {
        self.inner.major_param.as_deref()
    }

    /// Route identity: method and template.
    pub fn key(&self) -> String {
        format!("{} {}", self.inner.method, self.inner.template)
    }

    /// Substitutes every placeholder with the matching value.
    ///
    /// Values are percent-encoded. Fails if a placeholder has no value.
    pub fn compile(&self, params: &[(&str, &str)]) -> Result<CompiledRoute> {
        let mut path = String::with_capacity(self.inner.template.len() + 32);
        let mut rest = self.inner.template.as_str();

        while let Some(start) = rest.find('{') {
            let Some(len) = rest[start..].find('}') else {
                break;
            };
            let name = &rest[start + 1..start + len];
            let value = lookup(params, name).ok_or_else(|| RestError::MissingPathParam {
                route: self.key(),
                param: name.to_string(),
            })?;
            path.push_str(&rest[..start]);
            path.push_str(&urlencoding::encode(value));
            rest = &rest[start + len + 1..];
        }
        path.push_str(rest);

        let major_value = match self.major_param() {
            Some(major) => lookup(params, major)
                .ok_or_else(|| RestError::MissingPathParam {
                    route: self.key(),
                    param: major.to_string(),
                })?
                .to_string(),
            None => NO_MAJOR.to_string(),
        };

        Ok(CompiledRoute {
            route: self.clone(),
            path,
            major_value,
        })
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.inner.method, self.inner.template)
    }
}

fn lookup<'a>(params: &[(&str, &'a str)], name: &str) -> Option<&'a str> {
    params.iter().find(|(k, _)| *k == name).map(|(_, v)| *v)
}

fn parse_params(template: &str) -> Vec<String> {
    let mut params = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        params.push(rest[start + 1..start + len].to_string());
        rest = &rest[start + len + 1..];
    }
    params
}

/// A route with concrete parameter values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompiledRoute {
    route: Route,
    path: String,
    major_value: String,
}

impl CompiledRoute {
    /// The template this was compiled from.
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// HTTP method.
    pub fn method(&self) -> Method {
        self.route.method()
    }

    /// Concrete request path, without query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Value of the major parameter, or `-` when the route has none.
    pub fn major_value(&self) -> &str {
        &self.major_value
    }

    /// Bucket key candidate used before the service assigns a bucket hash.
    pub fn grouping_key(&self) -> String {
        format!("UNKNOWN;{};{}", self.route.key(), self.major_value)
    }

    /// Bucket key once the service has assigned `hash` to this route.
    pub fn bucket_key(&self, hash: &str) -> String {
        format!("{};{}", hash, self.major_value)
    }

    /// Full URL under `base_url`, with url-encoded query parameters appended.
    pub fn url(&self, base_url: &str, query: &[(String, String)]) -> String {
        let mut url = format!("{}{}", base_url.trim_end_matches('/'), self.path);
        for (i, (key, value)) in query.iter().enumerate() {
            url.push(if i == 0 { '?' } else { '&' });
            url.push_str(&urlencoding::encode(key));
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }
        url
    }
}

impl fmt::Display for CompiledRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.route.method(), self.path)
    }
}
