/*
 * Copyright (C) 2025 The Canaryop Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::env;
use std::error::Error;
use std::fs;

use crate::canaryop::util::{new_error, with_context};

/// Enum for supported configuration parameters
#[derive(Debug)]
pub enum Config {
    NamespaceFile,
    TokenFile,
    Server,
    Listen,
    LogFormat,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::NamespaceFile => "CANARYOP_NAMESPACE_FILE",
            Config::TokenFile => "CANARYOP_TOKEN_FILE",
            Config::Server => "CANARYOP_SERVER",
            Config::Listen => "CANARYOP_LISTEN",
            Config::LogFormat => "CANARYOP_LOG_FORMAT",
        }
    }

    /// Returns the compiled-in default for the config parameter.
    pub fn default_value(&self) -> &'static str {
        match self {
            Config::NamespaceFile => "/var/run/secrets/kubernetes.io/serviceaccount/namespace",
            Config::TokenFile => "/var/run/secrets/kubernetes.io/serviceaccount/token",
            Config::Server => "https://kubernetes.default.svc",
            Config::Listen => "0.0.0.0:8080",
            Config::LogFormat => "text",
        }
    }

    /// Returns the effective value, either from environment or default.
    pub fn value(&self) -> String {
        match env::var(self.env_var()) {
            Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
            _ => self.default_value().to_string(),
        }
    }
}

/// Reads the operator's namespace from the ambient credentials file.
///
/// Called once at process start; the result is cached on the gateway for the
/// lifetime of the process. A missing or empty file is a fatal startup error.
pub fn read_namespace() -> Result<String, Box<dyn Error + Send + Sync>> {
    let path = Config::NamespaceFile.value();
    let contents = fs::read_to_string(&path)
        .map_err(|err| with_context(err, format!("Failed to read namespace file '{}'", path)))?;
    let namespace = contents.trim().to_string();
    if namespace.is_empty() {
        return Err(new_error(format!("Namespace file '{}' is empty", path)));
    }
    Ok(namespace)
}

/// Reads the bearer token for the ambient service-account identity, if any.
pub fn read_token() -> Option<String> {
    let path = Config::TokenFile.value();
    let token = fs::read_to_string(path).ok()?;
    let token = token.trim().to_string();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}
