//! Parameter schemas declared by container templates and the settings callers supply.
//!
//! Every resolved parameter is surfaced to the container as an environment variable
//! named by [`parameter_env_name`].
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::EnvVar;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix of every parameter environment variable.
pub const PARAM_ENV_PREFIX: &str = "OCULAR_PARAM_";

/// A parameter declared by a downloader, uploader or crawler.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDefinition {
    /// Name callers use in a [`ParameterSetting`].
    pub name: String,
    /// Free-form description shown to users.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether a caller has to supply the parameter when no default exists.
    #[serde(default)]
    pub required: bool,
    /// Value used when the caller does not supply one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// A value supplied for a declared parameter.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ParameterSetting {
    /// Name of the declared parameter.
    pub name: String,
    /// Value to pass.
    pub value: String,
}

impl ParameterSetting {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Settings that do not match the declared parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error("invalid parameters (missing: [{}], unknown: [{}])", .missing.join(", "), .unknown.join(", "))]
pub struct ParameterError {
    /// Required parameters without a value or default.
    pub missing: Vec<String>,
    /// Supplied settings naming no declared parameter.
    pub unknown: Vec<String>,
}

/// A declared parameter together with the value it resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedParameter {
    /// Declared parameter name.
    pub name: String,
    /// Supplied value, else the default; `None` when neither exists.
    pub value: Option<String>,
}

impl ResolvedParameter {
    /// Environment variable for this parameter, omitted when it has no value.
    pub fn env_var(&self) -> Option<EnvVar> {
        self.value.as_ref().map(|value| EnvVar {
            name: parameter_env_name(&self.name),
            value: Some(value.clone()),
            ..EnvVar::default()
        })
    }
}

/// Check `settings` against `definitions` and resolve every declared parameter.
///
/// The result follows declaration order. When a setting is given more than once the
/// last one wins.
pub fn resolve(
    definitions: &[ParameterDefinition],
    settings: &[ParameterSetting],
) -> Result<Vec<ResolvedParameter>, ParameterError> {
    let supplied: BTreeMap<&str, &str> = settings
        .iter()
        .map(|s| (s.name.as_str(), s.value.as_str()))
        .collect();

    let mut err = ParameterError::default();
    for name in supplied.keys() {
        if !definitions.iter().any(|d| d.name == *name) {
            err.unknown.push((*name).to_string());
        }
    }

    let mut resolved = Vec::with_capacity(definitions.len());
    for def in definitions {
        let value = supplied
            .get(def.name.as_str())
            .map(|v| (*v).to_string())
            .or_else(|| def.default.clone());
        if def.required && value.is_none() {
            err.missing.push(def.name.clone());
        }
        resolved.push(ResolvedParameter {
            name: def.name.clone(),
            value,
        });
    }

    if err.missing.is_empty() && err.unknown.is_empty() {
        Ok(resolved)
    } else {
        Err(err)
    }
}

/// Environment variables for a resolved parameter list.
pub fn env_vars(resolved: &[ResolvedParameter]) -> Vec<EnvVar> {
    resolved.iter().filter_map(ResolvedParameter::env_var).collect()
}

/// Upper-case `name` and replace every character outside `[A-Z0-9_]` with `_`.
pub fn sanitize_env_name(name: &str) -> String {
    name.chars()
        .map(|c| match c.to_ascii_uppercase() {
            u @ ('A'..='Z' | '0'..='9' | '_') => u,
            _ => '_',
        })
        .collect()
}

/// Environment variable carrying the parameter `name`.
///
/// Names that already carry the prefix map to themselves, so applying the
/// transform twice is the same as applying it once.
pub fn parameter_env_name(name: &str) -> String {
    let sanitized = sanitize_env_name(name);
    if sanitized.starts_with(PARAM_ENV_PREFIX) {
        sanitized
    } else {
        format!("{PARAM_ENV_PREFIX}{sanitized}")
    }
}
