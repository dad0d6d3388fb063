// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;

use crate::{AppError, AppResult};

/// Key a wildcard capture is stored under.
pub const WILDCARD_KEY: &str = "*";
/// Prefix under which every query pair is exposed.
pub const QUERY_PREFIX: &str = "query.";

/// Values captured while matching a route, keyed by parameter name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteParams {
    values: BTreeMap<String, String>,
}

impl RouteParams {
    pub fn new() -> Self {
        RouteParams::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Raw query value, regardless of whether the template declared the key.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.values
            .get(&format!("{}{}", QUERY_PREFIX, key))
            .map(String::as_str)
    }

    pub fn wildcard(&self) -> Option<&str> {
        self.get(WILDCARD_KEY)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn insert_query(&mut self, query: &[(String, String)]) {
        for (key, value) in query {
            self.values
                .insert(format!("{}{}", QUERY_PREFIX, key), value.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    /// Must equal the path segment exactly.
    Static(String),
    PathParameter(String),
    /// `*`: the rest of the path when last, one segment otherwise.
    Wildcard,
    /// `?key`, `?key={name}` or `?key=default`.
    QueryParameter {
        key: String,
        name: String,
        default: Option<String>,
    },
}

/// A compiled `/literal/{param}/*?key={name}&other=default` pattern.
#[derive(Debug, Clone)]
pub struct RouteTemplate {
    raw: String,
    path: Vec<Part>,
    query: Vec<Part>,
}

fn parameter_name(segment: &str) -> Option<&str> {
    segment.strip_prefix('{')?.strip_suffix('}')
}

impl RouteTemplate {
    pub fn parse(template: &str) -> AppResult<RouteTemplate> {
        let (path, query) = match template.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (template, None),
        };

        let mut path_parts = Vec::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let part = if segment == WILDCARD_KEY {
                Part::Wildcard
            } else if let Some(name) = parameter_name(segment) {
                if name.is_empty() || name.contains(['{', '}']) {
                    return Err(AppError::InvalidValue(format!(
                        "bad parameter {:?} in route template {:?}",
                        segment, template
                    )));
                }
                Part::PathParameter(name.to_string())
            } else if segment.contains(['{', '}']) {
                return Err(AppError::InvalidValue(format!(
                    "unbalanced braces in segment {:?} of route template {:?}",
                    segment, template
                )));
            } else {
                Part::Static(segment.to_string())
            };
            path_parts.push(part);
        }

        let mut query_parts = Vec::new();
        for pair in query.unwrap_or_default().split('&').filter(|s| !s.is_empty()) {
            let (key, value) = match pair.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (pair, None),
            };
            if key.is_empty() {
                continue;
            }
            let part = match value.map(|v| (v, parameter_name(v))) {
                Some((_, Some(name))) if !name.is_empty() => Part::QueryParameter {
                    key: key.to_string(),
                    name: name.to_string(),
                    default: None,
                },
                Some((default, None)) if !default.is_empty() => Part::QueryParameter {
                    key: key.to_string(),
                    name: key.to_string(),
                    default: Some(default.to_string()),
                },
                _ => Part::QueryParameter {
                    key: key.to_string(),
                    name: key.to_string(),
                    default: None,
                },
            };
            query_parts.push(part);
        }

        Ok(RouteTemplate {
            raw: template.to_string(),
            path: path_parts,
            query: query_parts,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn parts(&self) -> impl Iterator<Item = &Part> {
        self.path.iter().chain(self.query.iter())
    }

    /// Returns a copy with `prefix`'s segments placed in front of the path.
    pub(crate) fn prefixed(&self, prefix: &str) -> AppResult<RouteTemplate> {
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return Ok(self.clone());
        }
        let template = format!("{}/{}", prefix, self.raw.trim_start_matches('/'));
        RouteTemplate::parse(&template)
    }

    /// Matches the path positionally and collects query values.
    ///
    /// Captured path parameters and wildcards must not be empty; query
    /// parameters never fail a match.
    pub fn matches(&self, path: &str, query: &[(String, String)]) -> Option<RouteParams> {
        let segments: Vec<&str> = path.strip_prefix('/').unwrap_or(path).split('/').collect();
        let mut params = RouteParams::new();
        let mut consumed = self.path.len();

        for (index, part) in self.path.iter().enumerate() {
            let segment = segments.get(index).copied().unwrap_or_default();
            match part {
                Part::Static(literal) => {
                    if segment != literal {
                        return None;
                    }
                }
                Part::PathParameter(name) => {
                    if segment.is_empty() {
                        return None;
                    }
                    params.insert(name.as_str(), segment);
                }
                Part::Wildcard if index + 1 == self.path.len() => {
                    let rest = segments.get(index..).unwrap_or_default().join("/");
                    let rest = rest.trim_end_matches('/');
                    if rest.is_empty() {
                        return None;
                    }
                    params.insert(WILDCARD_KEY, rest);
                    consumed = segments.len();
                }
                Part::Wildcard => {
                    if segment.is_empty() {
                        return None;
                    }
                    params.insert(WILDCARD_KEY, segment);
                }
                Part::QueryParameter { .. } => {}
            }
        }

        // trailing slash tolerance
        if segments.iter().skip(consumed).any(|s| !s.is_empty()) {
            return None;
        }

        for part in &self.query {
            if let Part::QueryParameter { key, name, default } = part {
                match query.iter().find(|(k, _)| k == key) {
                    Some((_, value)) => params.insert(name.as_str(), value.as_str()),
                    None => {
                        if let Some(default) = default {
                            params.insert(name.as_str(), default.as_str());
                        }
                    }
                }
            }
        }
        params.insert_query(query);
        Some(params)
    }
}
