//! Resource naming for the function stack.
//!
//! Every provisioned resource is named `{app}-{env}-{kind}` so several
//! environments can live in one account.

use crate::config::{DeploymentConfig, ServerConfig};
use std::collections::BTreeMap;

impl DeploymentConfig {
    pub fn stack_name(&self) -> String {
        format!("{}-{}-stack", self.app_name, self.env_suffix)
    }

    pub fn resource_name(&self, kind: &str) -> String {
        format!("{}-{}-{}", self.app_name, self.env_suffix, kind)
    }

    pub fn function_name(&self) -> String {
        self.resource_name("function")
    }

    pub fn role_name(&self) -> String {
        self.resource_name("lambda-role")
    }

    pub fn log_group_name(&self) -> String {
        format!("/aws/lambda/{}", self.function_name())
    }

    /// Tags applied to every resource in the stack.
    pub fn tags(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Application", self.app_name.clone()),
            ("Environment", self.env_suffix.clone()),
        ]
    }
}

/// Environment set on the function resource, read back by
/// [`Config::apply_env_overrides`](crate::config::Config::apply_env_overrides).
pub fn function_environment(server: &ServerConfig) -> BTreeMap<&'static str, String> {
    BTreeMap::from([
        ("MODEL_PATH", server.model_path.display().to_string()),
        ("CONTEXT_SIZE", server.ctx_size.to_string()),
        ("THREADS", server.threads.to_string()),
    ])
}
