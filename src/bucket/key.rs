//! Bucket identity and route templates.
//!
//! A bucket is identified by the HTTP method, the route *template* (not the
//! concrete path) and the value of the route's major parameter. Two requests
//! share quota iff all three agree; `/channels/1/messages` and
//! `/channels/2/messages` are independent buckets, while every minor parameter
//! (message id, user id, ...) is erased by the template.

use crate::request::{ApiRequest, Method, RequestDescriptor};
use std::borrow::Cow;
use std::fmt;

/// Errors produced when resolving or rendering a route template.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// Unbalanced braces or an empty `{}` placeholder.
    #[error("malformed route template `{template}`")]
    MalformedTemplate {
        /// Template as supplied.
        template: String,
    },
    /// The template names a placeholder that no parameter fills.
    #[error("route `{template}` is missing a value for `{name}`")]
    MissingParameter {
        /// Template as supplied.
        template: String,
        /// Placeholder without a value.
        name: String,
    },
}

/// The path parameter that partitions an otherwise identical route.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MajorParameter {
    Channel(String),
    Guild(String),
    Webhook {
        id: String,
        /// Routes authenticated by the token are limited per token.
        token: Option<String>,
    },
}

impl fmt::Display for MajorParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MajorParameter::Channel(id) => write!(f, "channel:{id}"),
            MajorParameter::Guild(id) => write!(f, "guild:{id}"),
            // token deliberately left out of logs
            MajorParameter::Webhook { id, .. } => write!(f, "webhook:{id}"),
        }
    }
}

/// Canonical rate-limit bucket identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    method: Method,
    template: Cow<'static, str>,
    major: Option<MajorParameter>,
}

impl BucketKey {
    /// Resolve the bucket for `template` filled with `params`.
    ///
    /// The major parameter is the first of `channel_id`, `guild_id` or
    /// `webhook_id` to appear in the template. Webhook buckets additionally
    /// carry `webhook_token` when the template uses it.
    pub fn resolve(
        method: Method,
        template: impl Into<Cow<'static, str>>,
        params: &[(&str, &str)],
    ) -> Result<Self, RouteError> {
        let template = template.into();
        let lookup = |name: &str| -> Result<String, RouteError> {
            params.iter().find(|(k, _)| *k == name).map(|(_, v)| (*v).to_owned()).ok_or_else(
                || RouteError::MissingParameter {
                    template: template.to_string(),
                    name: name.to_owned(),
                },
            )
        };

        let names: Vec<&str> = segments(&template)?
            .into_iter()
            .filter_map(|s| match s {
                Segment::Param(name) => Some(name),
                Segment::Literal(_) => None,
            })
            .collect();

        let mut major = None;
        for &name in &names {
            major = match name {
                "channel_id" => Some(MajorParameter::Channel(lookup(name)?)),
                "guild_id" => Some(MajorParameter::Guild(lookup(name)?)),
                "webhook_id" => {
                    let token = if names.contains(&"webhook_token") {
                        Some(lookup("webhook_token")?)
                    } else {
                        None
                    };
                    Some(MajorParameter::Webhook { id: lookup(name)?, token })
                }
                _ => continue,
            };
            break;
        }

        Ok(Self { method, template, major })
    }

    /// Key for a route with no major parameter.
    pub fn unpartitioned(method: Method, template: impl Into<Cow<'static, str>>) -> Self {
        Self { method, template: template.into(), major: None }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn major(&self) -> Option<&MajorParameter> {
        self.major.as_ref()
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.template)?;
        if let Some(major) = &self.major {
            write!(f, " [{major}]")?;
        }
        Ok(())
    }
}

/// A route template plus the values needed to render it.
///
/// ```
/// use ratelane::{Method, Route};
///
/// let route = Route::new(Method::Post, "/channels/{channel_id}/messages")
///     .param("channel_id", 123);
/// assert_eq!(route.path().unwrap(), "/channels/123/messages");
/// assert_eq!(route.bucket_key().unwrap().to_string(),
///     "POST /channels/{channel_id}/messages [channel:123]");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    method: Method,
    template: Cow<'static, str>,
    params: Vec<(&'static str, String)>,
    query: Vec<(&'static str, String)>,
}

impl Route {
    pub fn new(method: Method, template: impl Into<Cow<'static, str>>) -> Self {
        Self { method, template: template.into(), params: Vec::new(), query: Vec::new() }
    }

    pub fn param(mut self, name: &'static str, value: impl ToString) -> Self {
        self.params.push((name, value.to_string()));
        self
    }

    /// Append a query-string pair. Query values never affect the bucket.
    pub fn query(mut self, name: &'static str, value: impl ToString) -> Self {
        self.query.push((name, value.to_string()));
        self
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Render the concrete path.
    ///
    /// Parameter and query values are percent-encoded, so a value can never
    /// add path segments or query pairs of its own.
    pub fn path(&self) -> Result<String, RouteError> {
        let mut path = String::with_capacity(self.template.len() + 16);
        for segment in segments(&self.template)? {
            match segment {
                Segment::Literal(text) => path.push_str(text),
                Segment::Param(name) => encode_component(&mut path, self.value(name)?),
            }
        }
        for (i, (name, value)) in self.query.iter().enumerate() {
            path.push(if i == 0 { '?' } else { '&' });
            encode_component(&mut path, name);
            path.push('=');
            encode_component(&mut path, value);
        }
        Ok(path)
    }

    pub fn bucket_key(&self) -> Result<BucketKey, RouteError> {
        let params: Vec<(&str, &str)> =
            self.params.iter().map(|(k, v)| (*k, v.as_str())).collect();
        BucketKey::resolve(self.method, self.template.clone(), &params)
    }

    pub fn descriptor(&self) -> Result<RequestDescriptor, RouteError> {
        Ok(RequestDescriptor::new(self.method, self.path()?))
    }

    /// Bare request (no body) for this route.
    pub fn request(&self) -> Result<ApiRequest, RouteError> {
        Ok(ApiRequest::new(self.descriptor()?, self.bucket_key()?))
    }

    fn value(&self, name: &str) -> Result<&str, RouteError> {
        self.params.iter().find(|(k, _)| *k == name).map(|(_, v)| v.as_str()).ok_or_else(|| {
            RouteError::MissingParameter {
                template: self.template.to_string(),
                name: name.to_owned(),
            }
        })
    }
}

/// Append `value`, escaping everything outside the RFC 3986 unreserved set.
fn encode_component(out: &mut String, value: &str) {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(char::from(byte));
        } else {
            out.push('%');
            out.push(char::from(HEX[usize::from(byte >> 4)]));
            out.push(char::from(HEX[usize::from(byte & 0x0f)]));
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Param(&'a str),
}

fn segments(template: &str) -> Result<Vec<Segment<'_>>, RouteError> {
    let malformed = || RouteError::MalformedTemplate { template: template.to_owned() };
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find(|c: char| c == '{' || c == '}') {
        if rest.as_bytes()[open] == b'}' {
            return Err(malformed());
        }
        if open > 0 {
            out.push(Segment::Literal(&rest[..open]));
        }
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(malformed)?;
        let name = &after[..close];
        if name.is_empty() || name.contains('{') {
            return Err(malformed());
        }
        out.push(Segment::Param(name));
        rest = &after[close + 1..];
    }
    if !rest.is_empty() {
        out.push(Segment::Literal(rest));
    }
    Ok(out)
}
