//! Endpoint templates for logical VAT operations
//!
//! Each operation name maps to an HTTP method, a path pattern with named
//! `{placeholder}` segments and the query parameters it forwards. The
//! registry is built once at startup and never mutated afterwards.
//!
//! Placeholder values are pushed as whole path segments, so they are
//! percent-encoded and can not introduce extra path components.

use std::collections::HashMap;

use reqwest::Method;
use url::Url;

use crate::error::{Error, Result};

/// Caller-supplied placeholder and query values, keyed by name.
pub type Params = HashMap<String, String>;

/// Placeholder always filled from the session's account reference.
pub const ACCOUNT_PLACEHOLDER: &str = "vrn";

/// A query parameter an operation forwards to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParam {
    pub name: String,
    pub required: bool,
}

impl QueryParam {
    pub fn required(name: &str) -> Self {
        Self {
            name: name.into(),
            required: true,
        }
    }

    pub fn optional(name: &str) -> Self {
        Self {
            name: name.into(),
            required: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// Path pattern plus method and query contract for one operation.
#[derive(Debug, Clone)]
pub struct EndpointTemplate {
    pub method: Method,
    pattern: String,
    segments: Vec<Segment>,
    query: Vec<QueryParam>,
}

impl EndpointTemplate {
    /// Parse a path pattern such as `/organisations/vat/{vrn}/returns/{periodKey}`.
    ///
    /// A placeholder must occupy a whole segment.
    pub fn parse(method: Method, pattern: &str, query: Vec<QueryParam>) -> Result<Self> {
        let mut segments = Vec::new();
        for raw in pattern.split('/').filter(|s| !s.is_empty()) {
            let segment = match raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(name)
                    if !name.is_empty()
                        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') =>
                {
                    Segment::Placeholder(name.to_owned())
                }
                _ if raw.contains('{') || raw.contains('}') => {
                    return Err(Error::Config(format!(
                        "malformed placeholder segment {raw:?} in {pattern:?}"
                    )));
                }
                _ => Segment::Literal(raw.to_owned()),
            };
            segments.push(segment);
        }

        Ok(Self {
            method,
            pattern: pattern.to_owned(),
            segments,
            query,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Names of the path placeholders, in order.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    pub fn query(&self) -> &[QueryParam] {
        &self.query
    }

    /// Build the provider URL under `base`.
    ///
    /// Fails with `MissingParameter` when a placeholder or required query
    /// parameter has no value, and with `InvalidParameter` when a placeholder
    /// value is a `.` or `..` segment. Parameters the template does not name
    /// are ignored.
    pub fn resolve(&self, base: &Url, params: &Params) -> Result<Url> {
        let mut url = base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| Error::Config(format!("base URL {base} can not carry a path")))?;
            path.pop_if_empty();
            for segment in &self.segments {
                match segment {
                    Segment::Literal(text) => {
                        path.push(text);
                    }
                    Segment::Placeholder(name) => {
                        let value = non_empty(params, name)
                            .ok_or_else(|| Error::MissingParameter(name.clone()))?;
                        // `.` and `..` survive percent-encoding and would be
                        // normalized into a different provider path.
                        if matches!(value.trim(), "." | "..") {
                            return Err(Error::InvalidParameter(name.clone()));
                        }
                        path.push(value);
                    }
                }
            }
        }

        let mut pairs = Vec::new();
        for param in &self.query {
            match non_empty(params, &param.name) {
                Some(value) => pairs.push((param.name.as_str(), value)),
                None if param.required => {
                    return Err(Error::MissingParameter(param.name.clone()));
                }
                None => {}
            }
        }
        url.set_query(None);
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }
        Ok(url)
    }
}

fn non_empty<'a>(params: &'a Params, name: &str) -> Option<&'a str> {
    params
        .get(name)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
}

/// Immutable mapping from operation name to endpoint template.
#[derive(Debug, Clone)]
pub struct EndpointRegistry {
    templates: HashMap<String, EndpointTemplate>,
}

impl EndpointRegistry {
    /// Operations of the HMRC VAT (MTD) API.
    pub fn hmrc_vat() -> Result<Self> {
        let date_range = || vec![QueryParam::required("from"), QueryParam::required("to")];
        let entries = [
            (
                "obligations",
                Method::GET,
                "/organisations/vat/{vrn}/obligations",
                vec![
                    QueryParam::optional("from"),
                    QueryParam::optional("to"),
                    QueryParam::optional("status"),
                ],
            ),
            (
                "submitReturn",
                Method::POST,
                "/organisations/vat/{vrn}/returns",
                vec![],
            ),
            (
                "viewReturn",
                Method::GET,
                "/organisations/vat/{vrn}/returns/{periodKey}",
                vec![],
            ),
            (
                "liabilities",
                Method::GET,
                "/organisations/vat/{vrn}/liabilities",
                date_range(),
            ),
            (
                "payments",
                Method::GET,
                "/organisations/vat/{vrn}/payments",
                date_range(),
            ),
            (
                "penalties",
                Method::GET,
                "/organisations/vat/{vrn}/penalties",
                vec![],
            ),
            (
                "financialDetails",
                Method::GET,
                "/organisations/vat/{vrn}/financial-details/{penaltyChargeReference}",
                vec![],
            ),
        ];

        let mut templates = HashMap::new();
        for (name, method, pattern, query) in entries {
            templates.insert(name.to_owned(), EndpointTemplate::parse(method, pattern, query)?);
        }
        Ok(Self { templates })
    }

    /// Replace the path pattern of existing operations, keeping their method
    /// and query contract.
    pub fn with_overrides(mut self, overrides: &HashMap<String, String>) -> Result<Self> {
        for (name, pattern) in overrides {
            let current = self.templates.get(name).ok_or_else(|| {
                Error::Config(format!("override for unknown operation {name:?}"))
            })?;
            let replaced =
                EndpointTemplate::parse(current.method.clone(), pattern, current.query.clone())?;
            self.templates.insert(name.clone(), replaced);
        }
        Ok(self)
    }

    /// Look up the template for an operation.
    pub fn get(&self, operation: &str) -> Result<&EndpointTemplate> {
        self.templates
            .get(operation)
            .ok_or_else(|| Error::UnknownOperation(operation.to_owned()))
    }

    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }
}
