//! Tool registry: static declarations of the tool-protocol servers we can launch.
//!
//! Built once at startup from the built-in table plus `toolServers` in config. Credential
//! values are resolved from the environment here, so a missing key is known before any
//! request tries to start the server.

use crate::config::{self, Config, ToolServerConfig};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown tool server: {0}")]
    Unknown(String),
}

/// How to launch one tool server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDescriptor {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    /// Env key -> secret value; None when the referenced variable was unset at startup.
    pub credentials: BTreeMap<String, Option<String>>,
}

impl ToolDescriptor {
    /// Environment for the child process, or the first credential key that is missing.
    pub fn resolved_env(&self) -> Result<HashMap<String, String>, String> {
        self.credentials
            .iter()
            .map(|(k, v)| match v {
                Some(v) => Ok((k.clone(), v.clone())),
                None => Err(k.clone()),
            })
            .collect()
    }
}

/// (name, command, args, env template) for the servers the integrations use.
const BUILTIN_SERVERS: &[(&str, &str, &[&str], &[(&str, &str)])] = &[
    (
        "perplexity-ask",
        "npx",
        &["-y", "server-perplexity-ask"],
        &[("PERPLEXITY_API_KEY", "${PERPLEXITY_API_KEY}")],
    ),
    ("playwright", "npx", &["@playwright/mcp"], &[]),
    (
        "chatwork",
        "npx",
        &["@chatwork/mcp-server"],
        &[("CHATWORK_API_TOKEN", "${CHATWORK_API_TOKEN}")],
    ),
    (
        "slack",
        "npx",
        &["-y", "@modelcontextprotocol/server-slack"],
        &[
            ("SLACK_BOT_TOKEN", "${SLACK_BOT_TOKEN}"),
            ("SLACK_TEAM_ID", "${SLACK_TEAM_ID}"),
        ],
    ),
    (
        "airtable",
        "npx",
        &["-y", "airtable-mcp-server"],
        &[("AIRTABLE_API_KEY", "${AIRTABLE_API_KEY}")],
    ),
];

/// Read-only set of tool server descriptors.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    descriptors: BTreeMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    /// Built-ins merged with config overrides, credentials resolved from the process env.
    pub fn from_config(config: &Config) -> Self {
        Self::from_config_with(config, config::expand_env)
    }

    /// Same as [`ToolRegistry::from_config`] with an explicit `${VAR}` expander.
    pub fn from_config_with<F>(config: &Config, expand: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut descriptors = BTreeMap::new();
        for (name, command, args, env) in BUILTIN_SERVERS {
            let credentials = env
                .iter()
                .map(|(k, template)| (k.to_string(), expand(template)))
                .collect();
            descriptors.insert(
                name.to_string(),
                ToolDescriptor {
                    name: name.to_string(),
                    command: command.to_string(),
                    args: args.iter().map(|a| a.to_string()).collect(),
                    credentials,
                },
            );
        }
        for (name, server) in &config.tool_servers {
            if descriptors.contains_key(name) {
                log::debug!("tool registry: config overrides built-in server {}", name);
            }
            descriptors.insert(name.clone(), descriptor_from_config(name, server, &expand));
        }
        Self { descriptors }
    }

    pub fn insert(&mut self, descriptor: ToolDescriptor) {
        self.descriptors.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.descriptors.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.descriptors.keys()
    }

    /// Descriptors for the given server names, in order. Any unknown name fails the whole lookup.
    pub fn select(&self, names: &[String]) -> Result<Vec<ToolDescriptor>, RegistryError> {
        names
            .iter()
            .map(|n| {
                self.descriptors
                    .get(n)
                    .cloned()
                    .ok_or_else(|| RegistryError::Unknown(n.clone()))
            })
            .collect()
    }
}

fn descriptor_from_config<F>(name: &str, server: &ToolServerConfig, expand: &F) -> ToolDescriptor
where
    F: Fn(&str) -> Option<String>,
{
    ToolDescriptor {
        name: name.to_string(),
        command: server.command.clone(),
        args: server.args.clone(),
        credentials: server
            .env
            .iter()
            .map(|(k, v)| (k.clone(), expand(v)))
            .collect(),
    }
}
