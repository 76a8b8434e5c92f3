// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Route table shared by direct requests and batch items.
//!
//! Patterns are `/`-separated segments where `:name` captures one segment.
//! When several patterns match, the most specific wins: segments are compared
//! left to right and a static segment beats a parameter. Two routes with the
//! same verb and the same shape cannot both be registered, so the winner is
//! always unique and registration order never matters.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use axum::http::Method;
use regex::Regex;

use crate::api::CustomHandler;
use crate::error::{Error, Result};
use crate::request::PathParams;
use crate::resource::Resource;

static PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^:([A-Za-z_][A-Za-z0-9_]*)$").expect("valid param regex"));

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Static(String),
    Param(String),
}

/// A parsed route pattern such as `/persons/:key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    raw: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    /// Parse a pattern. It must start with `/`.
    pub fn parse(pattern: &str) -> Result<Self> {
        let Some(rest) = pattern.strip_prefix('/') else {
            return Err(Error::Configuration(format!(
                "route pattern '{}' must start with '/'",
                pattern
            )));
        };
        let segments = rest
            .split('/')
            .map(|segment| {
                if segment.starts_with(':') {
                    PARAM
                        .captures(segment)
                        .map(|c| Segment::Param(c[1].to_string()))
                        .ok_or_else(|| {
                            Error::Configuration(format!(
                                "invalid parameter '{}' in route pattern '{}'",
                                segment, pattern
                            ))
                        })
                } else {
                    Ok(Segment::Static(segment.to_string()))
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match a path (query string already removed) and extract parameters.
    pub fn matches(&self, path: &str) -> Option<PathParams> {
        let rest = path.strip_prefix('/')?;
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = PathParams::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Static(s) if s == part => {}
                Segment::Static(_) => return None,
                Segment::Param(_) if part.is_empty() => return None,
                Segment::Param(name) => {
                    let value = urlencoding::decode(part)
                        .map(|v| v.into_owned())
                        .unwrap_or_else(|_| part.to_string());
                    params.insert(name.clone(), value);
                }
            }
        }
        Some(params)
    }

    /// Static segments rank above parameters, compared left to right.
    fn specificity(&self) -> Vec<bool> {
        self.segments
            .iter()
            .map(|s| matches!(s, Segment::Static(_)))
            .collect()
    }

    fn shape(&self) -> Vec<Option<&str>> {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Static(s) => Some(s.as_str()),
                Segment::Param(_) => None,
            })
            .collect()
    }
}

/// What runs when a route matches.
#[derive(Clone)]
pub enum HandlerKind {
    /// `GET /type/:key`
    Get,
    /// `PUT /type/:key`
    Put,
    /// `PATCH /type/:key`
    Patch,
    /// `DELETE /type/:key`
    Delete,
    /// `GET /type`
    List,
    /// `PUT|POST …/batch` and `…/batch_streaming`
    Batch {
        /// Results are streamed with keep-alive.
        streaming: bool,
    },
    /// Application route.
    Custom(Arc<dyn CustomHandler>),
}

impl std::fmt::Debug for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Get => write!(f, "Get"),
            Self::Put => write!(f, "Put"),
            Self::Patch => write!(f, "Patch"),
            Self::Delete => write!(f, "Delete"),
            Self::List => write!(f, "List"),
            Self::Batch { streaming } => write!(f, "Batch {{ streaming: {} }}", streaming),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// One registered route.
#[derive(Debug, Clone)]
pub struct BatchHandlerRecord {
    /// Path pattern.
    pub pattern: RoutePattern,
    /// HTTP verb.
    pub verb: Method,
    /// Handler to run.
    pub kind: HandlerKind,
    /// Owning resource for the built-in handlers.
    pub resource: Option<Arc<Resource>>,
    /// Never writes: the request can run on a plain connection.
    pub read_only: bool,
    /// Output goes through a [`StreamingOutput`](crate::streaming::StreamingOutput).
    pub streaming: bool,
}

impl BatchHandlerRecord {
    /// Route with default flags (writable, not streaming).
    pub fn new(pattern: RoutePattern, verb: Method, kind: HandlerKind) -> Self {
        let streaming = matches!(kind, HandlerKind::Batch { streaming: true });
        Self {
            pattern,
            verb,
            kind,
            resource: None,
            read_only: false,
            streaming,
        }
    }

    /// Attach the owning resource.
    pub fn for_resource(mut self, resource: Arc<Resource>) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Mark as read-only.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Mark as streaming.
    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Batch endpoint.
    pub fn is_batch(&self) -> bool {
        matches!(self.kind, HandlerKind::Batch { .. })
    }
}

/// A matched route plus its extracted parameters.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    /// The winning route.
    pub record: Arc<BatchHandlerRecord>,
    /// Parameters captured from the path.
    pub params: PathParams,
}

/// Immutable route table.
#[derive(Debug, Default)]
pub struct RouteRegistry {
    routes: Vec<Arc<BatchHandlerRecord>>,
}

impl RouteRegistry {
    /// Build the table, rejecting ambiguous routes.
    pub fn new(routes: Vec<BatchHandlerRecord>) -> Result<Self> {
        let mut seen = HashSet::new();
        for route in &routes {
            let shape: Vec<Option<String>> = route
                .pattern
                .shape()
                .into_iter()
                .map(|s| s.map(str::to_string))
                .collect();
            if !seen.insert((route.verb.clone(), shape)) {
                return Err(Error::Configuration(format!(
                    "ambiguous route: {} {}",
                    route.verb,
                    route.pattern.as_str()
                )));
            }
        }
        Ok(Self {
            routes: routes.into_iter().map(Arc::new).collect(),
        })
    }

    /// Every route, in registration order.
    pub fn routes(&self) -> &[Arc<BatchHandlerRecord>] {
        &self.routes
    }

    /// Resolve `href` (query string allowed) for `verb`.
    pub fn match_href(&self, verb: &Method, href: &str) -> Option<RouteMatch> {
        let path = href.split_once('?').map_or(href, |(p, _)| p);
        self.routes
            .iter()
            .filter(|r| r.verb == *verb)
            .filter_map(|r| r.pattern.matches(path).map(|params| (r, params)))
            .max_by(|(a, _), (b, _)| a.pattern.specificity().cmp(&b.pattern.specificity()))
            .map(|(record, params)| RouteMatch {
                record: record.clone(),
                params,
            })
    }
}
