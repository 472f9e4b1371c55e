//! Agent catalog and routing.
//!
//! Hosts register the agents available to a pipeline; blocks reference them
//! by specific id or by role/capability selectors. Resolution is strict: a
//! role+capability selector that matches more than one agent is an error,
//! never a silent first-match.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::block::AgentRef;

/// One dispatchable agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Name of the provider adapter this agent dispatches through.
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_params: Option<Value>,
}

impl AgentSpec {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            role: None,
            capabilities: Vec::new(),
            provider: provider.into(),
            model: None,
            model_params: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Routing failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// No agent satisfied the reference.
    NotFound(String),
    /// A role+capability selector matched more than one agent.
    Ambiguous {
        role: String,
        capability: String,
        candidates: Vec<String>,
    },
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(what) => write!(f, "no agent matching {what}"),
            Self::Ambiguous {
                role,
                capability,
                candidates,
            } => write!(
                f,
                "agent selector role={role} capability={capability} is ambiguous: {}",
                candidates.join(", ")
            ),
        }
    }
}

/// In-memory catalog of agents, resolved in declaration order.
#[derive(Debug, Clone, Default)]
pub struct AgentCatalog {
    agents: Vec<AgentSpec>,
}

impl AgentCatalog {
    pub fn new(agents: Vec<AgentSpec>) -> Self {
        Self { agents }
    }

    pub fn with_agent(mut self, agent: AgentSpec) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// Resolve an agent reference: specific id, then role+capability, then
    /// role only, then any agent at all.
    ///
    /// A role+capability selector matching more than one agent fails with
    /// [`RouteError::Ambiguous`]. Role-only and any-agent fallbacks use
    /// catalog order (the selector expressed no preference).
    pub fn resolve(&self, agent_ref: &AgentRef) -> Result<&AgentSpec, RouteError> {
        if let Some(ref id) = agent_ref.id {
            return self
                .get(id)
                .ok_or_else(|| RouteError::NotFound(format!("id '{id}'")));
        }

        if let (Some(role), Some(capability)) = (&agent_ref.role, &agent_ref.capability) {
            let matches: Vec<&AgentSpec> = self
                .agents
                .iter()
                .filter(|a| {
                    a.role.as_deref() == Some(role.as_str())
                        && a.capabilities.iter().any(|c| c == capability)
                })
                .collect();
            match matches.len() {
                1 => return Ok(matches[0]),
                0 => {} // fall through to role-only
                _ => {
                    return Err(RouteError::Ambiguous {
                        role: role.clone(),
                        capability: capability.clone(),
                        candidates: matches.iter().map(|a| a.id.clone()).collect(),
                    })
                }
            }
        }

        if let Some(ref role) = agent_ref.role {
            if let Some(agent) = self
                .agents
                .iter()
                .find(|a| a.role.as_deref() == Some(role.as_str()))
            {
                return Ok(agent);
            }
        }

        self.agents
            .first()
            .ok_or_else(|| RouteError::NotFound("empty catalog".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> AgentCatalog {
        AgentCatalog::default()
            .with_agent(
                AgentSpec::new("coder-1", "anthropic")
                    .with_role("coder")
                    .with_capability("rust"),
            )
            .with_agent(
                AgentSpec::new("coder-2", "anthropic")
                    .with_role("coder")
                    .with_capability("rust"),
            )
            .with_agent(AgentSpec::new("reviewer-1", "openai").with_role("reviewer"))
    }

    #[test]
    fn test_specific_id_wins() {
        let c = catalog();
        let r = AgentRef::specific("coder-2");
        assert_eq!(c.resolve(&r).unwrap().id, "coder-2");
    }

    #[test]
    fn test_role_capability_ambiguity_is_an_error() {
        let c = catalog();
        let r = AgentRef {
            id: None,
            role: Some("coder".to_string()),
            capability: Some("rust".to_string()),
        };
        match c.resolve(&r) {
            Err(RouteError::Ambiguous { candidates, .. }) => {
                assert_eq!(candidates, vec!["coder-1", "coder-2"]);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn test_role_only_falls_back_to_catalog_order() {
        let c = catalog();
        let r = AgentRef {
            id: None,
            role: Some("coder".to_string()),
            capability: None,
        };
        assert_eq!(c.resolve(&r).unwrap().id, "coder-1");
    }

    #[test]
    fn test_unknown_capability_falls_back_to_role() {
        let c = catalog();
        let r = AgentRef {
            id: None,
            role: Some("reviewer".to_string()),
            capability: Some("security".to_string()),
        };
        assert_eq!(c.resolve(&r).unwrap().id, "reviewer-1");
    }

    #[test]
    fn test_empty_catalog_not_found() {
        let c = AgentCatalog::default();
        assert!(matches!(
            c.resolve(&AgentRef::default()),
            Err(RouteError::NotFound(_))
        ));
    }
}
