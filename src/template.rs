//! # Prompt template loading and structure
//!
//! A prompt template fixes everything about a prompt that does not depend on
//! the conversation: the system instruction, the two canned replies it asks the
//! model to use, and the labels framing the final user turn.
//!
//! The system instruction restricts the assistant to eye disease, makes it
//! answer only from the retrieved passages, and names two canned replies:
//! - `refusal`: returned verbatim for out-of-domain questions,
//! - `deflection`: returned when the passages cannot support an answer
//!   (missing mechanism, missing treatment specifics, missing staging criteria).
//!
//! The `{refusal}` and `{deflection}` placeholders in `system_prompt` are
//! replaced when the instruction is rendered, so a custom template only has to
//! state each canned reply once.
//!
//! Templates are stored per-user under the application's configuration
//! directory, inside a `templates/` subfolder:
//!
//! ```text
//! <config_dir>/templates/<name>.yaml
//! ```
//!
//! ## Minimal YAML example
//!
//! ```yaml
//! system_prompt: "Answer only eye-disease questions. Otherwise reply: {refusal}"
//! refusal: "Sorry, I only answer questions about eye disease."
//! deflection: "The available material is not enough; please see an ophthalmologist."
//! # Optional, these are the defaults:
//! # query_label: "[当前查询]"
//! # passages_label: "[相关片段]"
//! ```
//!
//! ## Loading a template
//!
//! ```no_run
//! use iris_rag::template::{PromptTemplate, load_template};
//!
//! # fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let template: PromptTemplate = load_template("eye_disease")?;
//! println!("System prompt: {}", template.render_system_prompt());
//! # Ok(()) }
//! ```

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};
use crate::vector_store::TextChunk;

/// Name of the template `iris init` writes.
pub const DEFAULT_TEMPLATE_NAME: &str = "eye_disease";

const DEFAULT_REFUSAL: &str = "抱歉，我专注于眼科疾病领域的问题，暂时无法回答其他类型的咨询。";

const DEFAULT_DEFLECTION: &str =
    "根据现有资料，我们暂时无法给出确切结论，建议咨询专业眼科医师进行详细检查。";

const DEFAULT_SYSTEM_PROMPT: &str = "\
# 角色设定
你是一名严谨的眼科医学知识助手，专门根据提供的医学文献片段回答用户关于眼部疾病的查询。你的回答必须基于提供的资料，不得掺杂外部知识或主观推测。

# 输入数据格式
用户将按以下结构提供信息：
[当前查询]: 用户提出的具体问题
[相关片段]: 由系统检索出的最相似文本段落

# 处理流程
1. 相关性判断：若查询涉及非眼科疾病（如牙科、皮肤科疾病）或与医疗无关（如烹饪、编程），立即回应：\"{refusal}\"
2. 内容验证：交叉核对所有片段与查询的医学相关性；片段间存在矛盾时补充说明：\"需要提醒，不同文献中存在表述差异...\"
3. 回答生成：
- 严格遵循片段证据链，禁止任何形式的知识延伸
- 专业表述需转换为患者易懂的科普语言
- 片段未覆盖关键病理机制、涉及治疗方案但无具体药物或手术描述、存在诊断标准但缺少分期分型说明时，回应：\"{deflection}\"

# 输出规范
- 采用分点式临床建议框架（病因分析→诊断要点→治疗原则）
- 中文口语化表达
- 响应长度控制在300字内";

fn default_query_label() -> String {
    "[当前查询]".to_string()
}

fn default_passages_label() -> String {
    "[相关片段]".to_string()
}

/// The conversation-independent parts of every prompt.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PromptTemplate {
    /// System instruction; may contain `{refusal}` and `{deflection}`.
    pub system_prompt: String,

    /// Fixed reply for questions outside the eye-disease domain.
    pub refusal: String,

    /// Fixed reply when the retrieved passages are insufficient.
    pub deflection: String,

    /// Label in front of the current query in the final user turn.
    #[serde(default = "default_query_label")]
    pub query_label: String,

    /// Label in front of the retrieved passages in the final user turn.
    #[serde(default = "default_passages_label")]
    pub passages_label: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            refusal: DEFAULT_REFUSAL.to_string(),
            deflection: DEFAULT_DEFLECTION.to_string(),
            query_label: default_query_label(),
            passages_label: default_passages_label(),
        }
    }
}

impl PromptTemplate {
    /// The system instruction with both canned replies substituted in.
    pub fn render_system_prompt(&self) -> String {
        self.system_prompt
            .replace("{refusal}", &self.refusal)
            .replace("{deflection}", &self.deflection)
    }

    /// The final user turn: the query verbatim, then one passage per line.
    ///
    /// ```
    /// use iris_rag::template::PromptTemplate;
    /// use iris_rag::vector_store::TextChunk;
    ///
    /// let turn = PromptTemplate::default().render_user_turn(
    ///     "青光眼有哪些症状？",
    ///     &[TextChunk { id: 0, text: "眼压升高。".into() }],
    /// );
    /// assert_eq!(turn, "[当前查询]: 青光眼有哪些症状？\n[相关片段]:\n眼压升高。");
    /// ```
    pub fn render_user_turn(&self, query: &str, passages: &[TextChunk]) -> String {
        let joined = passages
            .iter()
            .map(|chunk| chunk.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "{}: {query}\n{}:\n{joined}",
            self.query_label, self.passages_label
        )
    }

    /// Reject templates that would leave the model without its canned replies.
    pub fn validate(&self) -> Result<()> {
        if self.system_prompt.trim().is_empty() {
            return Err(RagError::Config("template system_prompt is empty".into()));
        }
        if self.refusal.trim().is_empty() || self.deflection.trim().is_empty() {
            return Err(RagError::Config(
                "template refusal and deflection must both be set".into(),
            ));
        }
        let rendered = self.render_system_prompt();
        for (placeholder, reply) in [
            ("{refusal}", &self.refusal),
            ("{deflection}", &self.deflection),
        ] {
            if !rendered.contains(reply.as_str()) {
                return Err(RagError::Config(format!(
                    "template system_prompt must include {placeholder}"
                )));
            }
        }
        Ok(())
    }
}

/// Load a prompt template by name from the user's config directory.
///
/// Resolves `<config_dir>/templates/<name>.yaml` and hands it to
/// [`load_template_from`].
pub fn load_template(name: &str) -> Result<PromptTemplate> {
    let path = crate::config_dir()?
        .join("templates")
        .join(format!("{name}.yaml"));
    load_template_from(&path)
}

/// Load and validate a prompt template from an explicit path.
///
/// ### Errors
/// - [`RagError::Io`] if the file does not exist or cannot be read,
/// - [`RagError::Config`] if the YAML does not describe a valid template.
pub fn load_template_from(path: &Path) -> Result<PromptTemplate> {
    tracing::info!("Loading template: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| RagError::io(path, e))?;
    let template: PromptTemplate = serde_yaml::from_str(&content)
        .map_err(|e| RagError::Config(format!("{}: {e}", path.display())))?;
    template.validate()?;
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_system_prompt_embeds_canned_replies() {
        let template = PromptTemplate::default();
        let rendered = template.render_system_prompt();

        assert!(rendered.contains(&template.refusal));
        assert!(rendered.contains(&template.deflection));
        assert!(!rendered.contains("{refusal}"));
        assert!(!rendered.contains("{deflection}"));
        assert!(rendered.contains("眼科"));
        assert!(rendered.contains("300"));
    }

    #[test]
    fn test_user_turn_without_passages() {
        let turn = PromptTemplate::default().render_user_turn("how do I bake bread", &[]);
        assert_eq!(turn, "[当前查询]: how do I bake bread\n[相关片段]:\n");
    }

    #[test]
    fn test_user_turn_joins_passages_by_newline() {
        let passages = vec![
            TextChunk {
                id: 3,
                text: "first".into(),
            },
            TextChunk {
                id: 1,
                text: "second".into(),
            },
        ];
        let turn = PromptTemplate::default().render_user_turn("q", &passages);
        assert_eq!(turn, "[当前查询]: q\n[相关片段]:\nfirst\nsecond");
    }

    #[test]
    fn test_load_template_valid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("retina.yaml");
        fs::write(
            &path,
            r#"
system_prompt: "Eye questions only. Otherwise say: {refusal} If unsure: {deflection}"
refusal: "Eye disease only, sorry."
deflection: "Please consult an ophthalmologist."
query_label: "[Query]"
"#,
        )
        .unwrap();

        let template = load_template_from(&path).unwrap();
        assert_eq!(
            template.render_system_prompt(),
            "Eye questions only. Otherwise say: Eye disease only, sorry. \
             If unsure: Please consult an ophthalmologist."
        );
        assert_eq!(template.query_label, "[Query]");
        assert_eq!(template.passages_label, "[相关片段]");
    }

    #[test]
    fn test_load_template_missing_file() {
        let dir = tempdir().unwrap();
        let err = load_template_from(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, RagError::Io { .. }));
    }

    #[test]
    fn test_load_template_invalid_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        fs::write(&path, "invalid: template: format").unwrap();
        assert!(matches!(
            load_template_from(&path),
            Err(RagError::Config(_))
        ));

        fs::write(&path, "system_prompt: \"x\"\nrefusal: \"\"\ndeflection: \"y\"\n").unwrap();
        assert!(matches!(
            load_template_from(&path),
            Err(RagError::Config(_))
        ));
    }

    #[test]
    fn test_template_must_place_both_replies() {
        let template = PromptTemplate {
            system_prompt: "Answer eye questions. Otherwise: {refusal}".into(),
            ..PromptTemplate::default()
        };
        match template.validate() {
            Err(RagError::Config(message)) => assert!(message.contains("{deflection}")),
            other => panic!("unexpected result: {other:?}"),
        }

        let template = PromptTemplate {
            system_prompt: "Answer eye questions.".into(),
            ..PromptTemplate::default()
        };
        assert!(matches!(template.validate(), Err(RagError::Config(_))));

        // spelling a reply out literally is as good as the placeholder
        let default = PromptTemplate::default();
        let template = PromptTemplate {
            system_prompt: format!("{} / {}", default.refusal, default.deflection),
            ..PromptTemplate::default()
        };
        assert!(template.validate().is_ok());
        assert!(PromptTemplate::default().validate().is_ok());
    }

    #[test]
    fn test_default_template_yaml_round_trip() {
        let yaml = serde_yaml::to_string(&PromptTemplate::default()).unwrap();
        let parsed: PromptTemplate = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, PromptTemplate::default());
    }
}
