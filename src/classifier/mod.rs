//! Task classification for incoming requests.
//!
//! Maps a raw request string to a [`TaskType`] using an ordered list of
//! keyword rules over the lower-cased input. The first matching rule wins:
//! code-generation and verification patterns are checked before the broader
//! "explain"/"write" patterns so that implementation requests are not routed
//! into long-form article workflows. Falls back to [`TaskType::SimpleQa`]
//! when nothing matches.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ClassifierError;

/// The task types the pipeline knows how to compose workflows for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    CodeGeneration,
    FactVerification,
    Comparison,
    Summarization,
    LongFormArticle,
    Explanation,
    SimpleQa,
}

impl TaskType {
    /// Returns all task types, in classifier priority order.
    pub fn all() -> Vec<TaskType> {
        vec![
            TaskType::CodeGeneration,
            TaskType::FactVerification,
            TaskType::Comparison,
            TaskType::Summarization,
            TaskType::LongFormArticle,
            TaskType::Explanation,
            TaskType::SimpleQa,
        ]
    }

    /// Parses a task type from its kebab-case name.
    pub fn parse(name: &str) -> Option<TaskType> {
        match name.trim().to_lowercase().as_str() {
            "code-generation" | "code" => Some(TaskType::CodeGeneration),
            "fact-verification" | "verification" => Some(TaskType::FactVerification),
            "comparison" | "compare" => Some(TaskType::Comparison),
            "summarization" | "summary" => Some(TaskType::Summarization),
            "long-form-article" | "article" => Some(TaskType::LongFormArticle),
            "explanation" | "explain" => Some(TaskType::Explanation),
            "simple-qa" | "qa" => Some(TaskType::SimpleQa),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskType::CodeGeneration => "code-generation",
            TaskType::FactVerification => "fact-verification",
            TaskType::Comparison => "comparison",
            TaskType::Summarization => "summarization",
            TaskType::LongFormArticle => "long-form-article",
            TaskType::Explanation => "explanation",
            TaskType::SimpleQa => "simple-qa",
        };
        write!(f, "{}", name)
    }
}

/// A single ordered classification rule: the rule matches when any of its
/// patterns matches the lower-cased request text.
struct Rule {
    task_type: TaskType,
    patterns: Vec<Regex>,
}

impl Rule {
    fn new(task_type: TaskType, patterns: &[&str]) -> Result<Self, ClassifierError> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            task_type,
            patterns,
        })
    }

    fn matches(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(text))
    }
}

/// Ordered-rule classifier mapping raw request text to a [`TaskType`].
///
/// No side effects and no failure modes beyond returning the default type.
pub struct TaskClassifier {
    rules: Vec<Rule>,
}

impl TaskClassifier {
    /// Builds the classifier with the default rule set.
    ///
    /// # Errors
    ///
    /// Returns `ClassifierError` if a rule pattern fails to compile.
    pub fn new() -> Result<Self, ClassifierError> {
        // Rule order is a deliberate priority. Implementation and
        // verification requests frequently contain "write" or "explain",
        // so those rules must run first.
        let rules = vec![
            Rule::new(
                TaskType::CodeGeneration,
                &[
                    r"\bimplement\b",
                    r"\bwrite (a |the |some )?(function|script|program|code|class|module)\b",
                    r"\bcode (for|that|to)\b",
                    r"\bfix (the |this |a )?(bug|error|code)\b",
                    r"\brefactor\b",
                ],
            )?,
            Rule::new(
                TaskType::FactVerification,
                &[
                    r"\bis it true\b",
                    r"\bverify\b",
                    r"\bfact.?check\b",
                    r"\bconfirm (that|whether)\b",
                    r"\btrue or false\b",
                ],
            )?,
            Rule::new(
                TaskType::Comparison,
                &[
                    r"\bcompare\b",
                    r"\bversus\b",
                    r"\bvs\.?\b",
                    r"\bdifference(s)? between\b",
                    r"\bpros and cons\b",
                    r"\bwhich is (better|faster|best)\b",
                ],
            )?,
            Rule::new(
                TaskType::Summarization,
                &[r"\bsummari[sz]e\b", r"\bsummary of\b", r"\btl;?dr\b"],
            )?,
            Rule::new(
                TaskType::LongFormArticle,
                &[
                    r"\bcomprehensive (guide|overview|article)\b",
                    r"\bwrite (a |an )?(guide|article|essay|report|tutorial)\b",
                    r"\bin.?depth\b",
                    r"\bdeep dive\b",
                ],
            )?,
            Rule::new(
                TaskType::Explanation,
                &[
                    r"\bexplain\b",
                    r"\bhow does\b",
                    r"\bhow do\b",
                    r"\bwhy (does|do|is|are)\b",
                    r"\bwhat causes\b",
                ],
            )?,
        ];

        Ok(Self { rules })
    }

    /// Classifies raw request text, returning the first matching rule's type.
    ///
    /// Ambiguous input is not an error: the deterministic fallback is
    /// [`TaskType::SimpleQa`].
    pub fn classify(&self, raw_text: &str) -> TaskType {
        let text = raw_text.to_lowercase();

        for rule in &self.rules {
            if rule.matches(&text) {
                return rule.task_type;
            }
        }

        TaskType::SimpleQa
    }
}
