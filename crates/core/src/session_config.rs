use crate::stage::Stage;

/// Everything a voice session needs to know before it connects.
///
/// Built once by the caller and never mutated while the session is alive. A
/// stage change means a new `SessionConfig` and a fresh connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionConfig {
    pub stage_title: String,
    pub stage_instruction: String,
    pub validation_criteria: String,
    pub global_instruction: String,
    /// Pre-retrieved knowledge blocks, injected verbatim.
    pub knowledge_snippets: Vec<String>,
}

impl SessionConfig {
    pub fn for_stage(
        stage: &Stage,
        global_instruction: &str,
        knowledge_snippets: Vec<String>,
    ) -> Self {
        Self {
            stage_title: stage.title.clone(),
            stage_instruction: stage.system_instruction.clone(),
            validation_criteria: stage.validation_criteria.clone(),
            global_instruction: global_instruction.to_string(),
            knowledge_snippets,
        }
    }

    /// Composes the single system instruction sent in the session setup.
    pub fn compose_instruction(&self) -> String {
        let mut sections = vec![
            format!("GLOBAL SYSTEM INSTRUCTION:\n{}", self.global_instruction.trim()),
            format!("CURRENT STAGE: {}", self.stage_title.trim()),
            format!("STAGE INSTRUCTION:\n{}", self.stage_instruction.trim()),
        ];

        let snippets: Vec<&str> = self
            .knowledge_snippets
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();
        if !snippets.is_empty() {
            sections.push(format!(
                "RETRIEVED KNOWLEDGE BASE (Use this information to answer user questions):\n{}",
                snippets.join("\n\n")
            ));
        }

        sections.push(format!(
            "HIDDEN VALIDATION CRITERIA:\n{}",
            self.validation_criteria.trim()
        ));
        sections.join("\n\n")
    }
}
