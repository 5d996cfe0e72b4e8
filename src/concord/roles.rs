//! Dynamic role synthesis.
//!
//! Turns a free-text topic into an ordered panel of expert personas, each
//! with a backing model and a tailored system instruction. Two structured
//! gateway calls do the work: a low-temperature topic analysis, then a
//! higher-temperature persona generation. Every failure degrades to generic
//! experts; synthesis never aborts a discussion.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::client_wrapper::{ChatMessage, ChatRole, GatewayClient, GatewayError};

/// Structured result of the topic-analysis call.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicAnalysis {
    pub primary_domain: String,
    #[serde(default)]
    pub sub_domains: Vec<String>,
    pub complexity: u8,
    #[serde(default)]
    pub key_aspects: Vec<String>,
    #[serde(default)]
    pub recommended_expert_types: Vec<String>,
}

impl TopicAnalysis {
    /// Fallback analysis used when the gateway call fails.
    fn generic() -> Self {
        Self {
            primary_domain: "general".to_string(),
            sub_domains: Vec::new(),
            complexity: 3,
            key_aspects: vec![
                "analysis".to_string(),
                "discussion".to_string(),
                "consensus".to_string(),
            ],
            recommended_expert_types: Vec::new(),
        }
    }
}

/// An expert persona, fixed for the life of a discussion.
#[derive(Debug, Clone, Serialize)]
pub struct RoleDefinition {
    /// Unique within a discussion.
    pub name: String,
    pub expertise: String,
    pub perspective: String,
    /// Opaque id routed through the gateway.
    pub backing_model_id: String,
    /// Full prompt embedding name, expertise, perspective, and the topic.
    pub system_instruction: String,
}

/// Persona fields as returned by the generation call, before a model and
/// system instruction are attached.
#[derive(Debug, Clone, Deserialize)]
struct PersonaDraft {
    name: String,
    expertise: String,
    perspective: String,
}

/// Synthesizes discussion panels from topics.
pub struct RoleSynthesizer {
    client: Arc<dyn GatewayClient>,
    meta_model_id: String,
    default_panel: Vec<String>,
}

impl RoleSynthesizer {
    pub fn new(
        client: Arc<dyn GatewayClient>,
        meta_model_id: impl Into<String>,
        default_panel: Vec<String>,
    ) -> Self {
        Self {
            client,
            meta_model_id: meta_model_id.into(),
            default_panel,
        }
    }

    /// Produce exactly `num_roles` personas for `topic`.
    ///
    /// Backing models cycle through `preferred_model_ids` when supplied,
    /// else through the default panel. Total failure is never raised upward:
    /// the worst outcome is a panel of generic experts.
    pub async fn synthesize(
        &self,
        topic: &str,
        num_roles: usize,
        preferred_model_ids: Option<&[String]>,
    ) -> Vec<RoleDefinition> {
        log::info!(
            "concord::roles: creating {} roles for topic: {}",
            num_roles,
            topic
        );

        let panel: Vec<String> = match preferred_model_ids {
            Some(ids) if !ids.is_empty() => {
                ids.iter().map(|id| self.client.normalize(id)).collect()
            }
            _ => self.default_panel.clone(),
        };

        let analysis = match self.analyze_topic(topic).await {
            Ok(analysis) => analysis,
            Err(e) => {
                log::warn!("concord::roles: topic analysis failed ({}), using generic", e);
                TopicAnalysis::generic()
            }
        };
        log::debug!(
            "concord::roles: topic analysis: {} (complexity {})",
            analysis.primary_domain,
            analysis.complexity
        );

        let mut drafts = match self.generate_personas(&analysis, num_roles).await {
            Ok(drafts) => drafts,
            Err(e) => {
                log::warn!(
                    "concord::roles: persona generation failed ({}), using generic panel",
                    e
                );
                Vec::new()
            }
        };

        // Truncate surplus, fill shortfall with generic experts; no re-call.
        drafts.truncate(num_roles);
        if drafts.len() < num_roles {
            log::warn!(
                "concord::roles: generator returned {} personas, requested {}; filling remainder",
                drafts.len(),
                num_roles
            );
            for k in drafts.len()..num_roles {
                drafts.push(PersonaDraft {
                    name: format!("Expert {}", k + 1),
                    expertise: format!("General expertise in {}", analysis.primary_domain),
                    perspective: format!("Perspective {}", k + 1),
                });
            }
        }

        disambiguate_names(&mut drafts);

        let roles: Vec<RoleDefinition> = drafts
            .into_iter()
            .enumerate()
            .map(|(i, draft)| {
                let backing_model_id = panel[i % panel.len()].clone();
                let system_instruction =
                    build_system_instruction(&draft.name, &draft.expertise, &draft.perspective, topic);
                RoleDefinition {
                    name: draft.name,
                    expertise: draft.expertise,
                    perspective: draft.perspective,
                    backing_model_id,
                    system_instruction,
                }
            })
            .collect();

        log::info!(
            "concord::roles: created panel: {:?}",
            roles.iter().map(|r| r.name.as_str()).collect::<Vec<_>>()
        );

        roles
    }

    async fn analyze_topic(&self, topic: &str) -> Result<TopicAnalysis, GatewayError> {
        let prompt = format!(
            "Analyze this discussion topic and determine:\n\
             1. Primary domain (medical, technical, business, scientific, social, etc.)\n\
             2. Sub-domains involved\n\
             3. Complexity level (1-5, where 1=simple, 5=highly complex)\n\
             4. Key aspects that should be covered\n\
             5. What types of experts would be valuable\n\n\
             Topic: \"{}\"\n\n\
             Return your analysis as a JSON object with these exact keys:\n\
             - primary_domain (string)\n\
             - sub_domains (array of strings)\n\
             - complexity (number 1-5)\n\
             - key_aspects (array of strings)\n\
             - recommended_expert_types (array of strings)",
            topic
        );

        let value = self
            .client
            .complete_json(
                &self.meta_model_id,
                &[ChatMessage::new(ChatRole::User, prompt)],
                0.25,
            )
            .await?;

        let mut analysis: TopicAnalysis = serde_json::from_value(value)
            .map_err(|e| GatewayError::Decode(format!("topic analysis: {}", e)))?;
        analysis.complexity = analysis.complexity.clamp(1, 5);
        Ok(analysis)
    }

    async fn generate_personas(
        &self,
        analysis: &TopicAnalysis,
        num_roles: usize,
    ) -> Result<Vec<PersonaDraft>, GatewayError> {
        let prompt = format!(
            "Based on this topic analysis, create {} expert roles for a discussion.\n\n\
             Domain: {}\n\
             Sub-domains: {}\n\
             Complexity: {}/5\n\
             Key aspects: {}\n\n\
             For each role, provide:\n\
             - name: Role title (e.g., \"Neurologist\", \"Cloud Architect\", \"Financial Analyst\")\n\
             - expertise: Specific area of expertise\n\
             - perspective: Unique perspective this role brings to the discussion\n\n\
             Return a JSON object with a \"roles\" array of these objects.",
            num_roles,
            analysis.primary_domain,
            analysis.sub_domains.join(", "),
            analysis.complexity,
            analysis.key_aspects.join(", "),
        );

        let value = self
            .client
            .complete_json(
                &self.meta_model_id,
                &[ChatMessage::new(ChatRole::User, prompt)],
                0.7,
            )
            .await?;

        // Gateways answer in one of three shapes: a bare array, an object
        // with a "roles" array, or a single persona object.
        let drafts_value = if value.is_array() {
            value
        } else if let Some(roles) = value.get("roles") {
            roles.clone()
        } else if value.get("name").is_some() && value.get("expertise").is_some() {
            serde_json::Value::Array(vec![value])
        } else {
            serde_json::Value::Array(Vec::new())
        };

        serde_json::from_value(drafts_value)
            .map_err(|e| GatewayError::Decode(format!("persona list: {}", e)))
    }
}

/// Append numeric suffixes to later duplicates, preserving order.
fn disambiguate_names(drafts: &mut [PersonaDraft]) {
    for i in 0..drafts.len() {
        let mut occurrence = 1;
        for j in 0..i {
            if drafts[j].name.eq_ignore_ascii_case(&drafts[i].name) {
                occurrence += 1;
            }
        }
        if occurrence > 1 {
            drafts[i].name = format!("{} {}", drafts[i].name, occurrence);
        }
    }
}

/// Template the persona fields and topic into the role's system instruction.
fn build_system_instruction(name: &str, expertise: &str, perspective: &str, topic: &str) -> String {
    format!(
        "You are a {} with deep expertise in {}.\n\n\
         Your unique perspective: {}\n\n\
         You are participating in a multi-agent discussion about: \"{}\"\n\n\
         Guidelines for your participation:\n\
         1. **Expertise-driven**: Contribute based on your specific knowledge and experience\n\
         2. **Respectful challenge**: When you disagree, explain why from your expertise\n\
         3. **Acknowledge others**: Recognize good points made by other participants\n\
         4. **Seek consensus**: Work toward agreement while maintaining professional standards\n\
         5. **Direct addressing**: Use @Name to address specific participants when relevant\n\
         6. **Natural conversation**: Don't use \"Round X\" or structured formats - just contribute naturally\n\n\
         Remember: You are a real expert in your field. Be confident, be professional, and contribute meaningfully to reach the best solution.",
        name, expertise, perspective, topic
    )
}
