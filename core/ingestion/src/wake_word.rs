use anyhow::{Context, Result};
use jarvis_schemas::BufferedMessage;
use regex::Regex;

/// Common mis-transcriptions of "Jarvis"
const JARVIS_VARIANTS: &[&str] = &[
    "jarvis", "jarvas", "jervis", "jarves", "jarvus", "javis", "jarvish", "jarviss",
];

/// Case-insensitive, word-bounded matcher for the assistant's name and its
/// phonetic near-misses.
#[derive(Debug, Clone)]
pub struct WakeWordDetector {
    pattern: Regex,
}

impl WakeWordDetector {
    pub fn new<S: AsRef<str>>(variants: &[S]) -> Result<Self> {
        let alternatives: Vec<String> = variants
            .iter()
            .map(|v| v.as_ref().trim().to_lowercase())
            .filter(|v| !v.is_empty())
            .map(|v| regex::escape(&v))
            .collect();

        if alternatives.is_empty() {
            anyhow::bail!("at least one wake word is required");
        }

        let pattern = Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|")))
            .context("Failed to compile wake word pattern")?;

        Ok(Self { pattern })
    }

    /// Detector for an assistant name plus any extra configured variants
    pub fn for_assistant(name: &str, extra: &[String]) -> Result<Self> {
        let mut variants: Vec<String> = if name.eq_ignore_ascii_case("jarvis") {
            JARVIS_VARIANTS.iter().map(|v| v.to_string()).collect()
        } else {
            vec![name.to_string()]
        };
        variants.extend(extra.iter().cloned());

        Self::new(&variants)
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }

    pub fn any_match(&self, messages: &[BufferedMessage]) -> bool {
        messages.iter().any(|m| self.is_match(&m.text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_variants() {
        let detector = WakeWordDetector::for_assistant("Jarvis", &[]).unwrap();
        assert!(detector.is_match("hello jarvis"));
        assert!(detector.is_match("Hey JARVIS, what's next?"));
        assert!(detector.is_match("okay jervis."));
        assert!(!detector.is_match("the jarvisian era"));
        assert!(!detector.is_match("nothing to see here"));
    }

    #[test]
    fn test_custom_assistant_and_extras() {
        let detector =
            WakeWordDetector::for_assistant("Friday", &["fryday".to_string()]).unwrap();
        assert!(detector.is_match("thanks friday"));
        assert!(detector.is_match("FRYDAY are you there"));
        assert!(!detector.is_match("hello jarvis"));
    }

    #[test]
    fn test_variants_are_escaped() {
        let detector = WakeWordDetector::new(&["c.a"]).unwrap();
        assert!(detector.is_match("hi c.a"));
        assert!(!detector.is_match("hi cxa"));
    }

    #[test]
    fn test_empty_variants_rejected() {
        assert!(WakeWordDetector::new(&["  "]).is_err());
    }

    #[test]
    fn test_any_match() {
        let detector = WakeWordDetector::for_assistant("Jarvis", &[]).unwrap();
        let messages = vec![
            BufferedMessage {
                text: "what time is it".to_string(),
                timestamp: 1.0,
                is_user: true,
            },
            BufferedMessage {
                text: "ask Jarvas".to_string(),
                timestamp: 4.0,
                is_user: false,
            },
        ];
        assert!(detector.any_match(&messages));
        assert!(!detector.any_match(&messages[..1]));
    }
}
