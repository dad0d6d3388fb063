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

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;

use crate::{AppError, AppResult};

bitflags! {
    /// Verbs a route accepts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Verb: u8 {
        const CREATE = 0b0000_0001;
        const GET = 0b0000_0010;
        const UPDATE = 0b0000_0100;
        const DELETE = 0b0000_1000;
        const OPTIONS = 0b0001_0000;
        const ALL = Self::CREATE.bits()
            | Self::GET.bits()
            | Self::UPDATE.bits()
            | Self::DELETE.bits()
            | Self::OPTIONS.bits();
    }
}

const NAMED: [(Verb, &str, &str); 5] = [
    (Verb::CREATE, "Create", "POST"),
    (Verb::GET, "Get", "GET"),
    (Verb::UPDATE, "Update", "PUT"),
    (Verb::DELETE, "Delete", "DELETE"),
    (Verb::OPTIONS, "Options", "OPTIONS"),
];

impl Verb {
    /// Maps an HTTP request method onto a single verb.
    pub fn from_http_method(method: &str) -> Option<Verb> {
        match method.to_ascii_uppercase().as_str() {
            "POST" => Some(Verb::CREATE),
            "GET" | "HEAD" => Some(Verb::GET),
            "PUT" | "PATCH" => Some(Verb::UPDATE),
            "DELETE" => Some(Verb::DELETE),
            "OPTIONS" => Some(Verb::OPTIONS),
            _ => None,
        }
    }

    /// HTTP methods covered by this set, in declaration order.
    pub fn http_methods(self) -> Vec<&'static str> {
        NAMED
            .iter()
            .filter(|(verb, _, _)| self.contains(*verb))
            .map(|(_, _, method)| *method)
            .collect()
    }

    /// Verb names covered by this set, in declaration order.
    pub fn names(self) -> Vec<&'static str> {
        NAMED
            .iter()
            .filter(|(verb, _, _)| self.contains(*verb))
            .map(|(_, name, _)| *name)
            .collect()
    }
}

impl FromStr for Verb {
    type Err = AppError;

    /// Accepts verb names (`Get`, `create`, `All`) as well as HTTP methods.
    fn from_str(s: &str) -> AppResult<Verb> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("all") {
            return Ok(Verb::ALL);
        }
        if let Some((verb, _, _)) = NAMED
            .iter()
            .find(|(_, name, _)| name.eq_ignore_ascii_case(trimmed))
        {
            return Ok(*verb);
        }
        Verb::from_http_method(trimmed)
            .ok_or_else(|| AppError::InvalidValue(format!("unknown verb: {}", s)))
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Verb::ALL {
            return write!(f, "All");
        }
        write!(f, "{}", self.names().join("|"))
    }
}
