//! Command parsing: leading mode-override tokens and inline substitution
//! tokens.
//!
//! Mode parsing is a pure, total function — an unrecognized leading `/word`
//! is ordinary text, never an error. Substitution is a separate pass that
//! fails fast when a referenced source cannot be read, before any network
//! call is made.

use skein_core::error::Error;
use skein_mcp::ToolRegistry;

// ============================================================================
// Processing modes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// One backend round trip, with at most one optional tool round trip.
    Chat,
    /// Multi-step loop with tool calls interleaved.
    Agent,
}

/// Result of the mode-override pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommand {
    /// `None` means "defer to the caller-selected mode".
    pub mode: Option<ProcessingMode>,
    /// Never contains the recognized leading token.
    pub clean_prompt: String,
    pub original_prompt: String,
}

/// Recognize a leading mode-override token: `/chat` | `/c` or
/// `/agent` | `/a`, case-insensitive, anchored at the start of the trimmed
/// input, spanning multiple lines.
pub fn parse(input: &str) -> ParsedCommand {
    let trimmed = input.trim();
    let (head, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest),
        None => (trimmed, ""),
    };

    let mode = match head.to_ascii_lowercase().as_str() {
        "/chat" | "/c" => Some(ProcessingMode::Chat),
        "/agent" | "/a" => Some(ProcessingMode::Agent),
        _ => None,
    };

    match mode {
        Some(mode) => ParsedCommand {
            mode: Some(mode),
            clean_prompt: rest.trim().to_string(),
            original_prompt: input.to_string(),
        },
        None => ParsedCommand {
            mode: None,
            clean_prompt: trimmed.to_string(),
            original_prompt: input.to_string(),
        },
    }
}

/// The mode actually used: the parsed override if present, else the
/// caller-selected one.
pub fn effective_mode(input: &str, ui_selected: ProcessingMode) -> ProcessingMode {
    parse(input).mode.unwrap_or(ui_selected)
}

// ============================================================================
// Inline substitution
// ============================================================================

/// Host capabilities the substitution pass reads from. The core never knows
/// how a document or clipboard is actually backed.
pub trait PromptSources: Send + Sync {
    fn active_document(&self) -> Option<String>;
    fn clipboard(&self) -> Option<String>;
}

/// Sources for a host with neither a document nor a clipboard. Any token
/// referencing them fails with a descriptive parse error.
pub struct NoSources;

impl PromptSources for NoSources {
    fn active_document(&self) -> Option<String> {
        None
    }

    fn clipboard(&self) -> Option<String> {
        None
    }
}

const RESOURCE_PREFIX: &str = "resource:";

/// Replace `{{document}}`, `{{clipboard}}` and `{{resource:<uri>}}` tokens
/// with the content they denote.
///
/// If any recognized token cannot be resolved the whole pass fails with
/// [`Error::Parse`] naming the missing source — no partial substitution is
/// ever produced. Unrecognized `{{...}}` spans pass through untouched.
pub async fn expand_tokens(
    prompt: &str,
    sources: &dyn PromptSources,
    registry: &ToolRegistry,
) -> Result<String, Error> {
    let mut out = String::with_capacity(prompt.len());
    let mut rest = prompt;

    while let Some(start) = rest.find("{{") {
        let Some(end) = rest[start..].find("}}").map(|i| start + i) else {
            // Unterminated marker: ordinary text.
            break;
        };
        out.push_str(&rest[..start]);
        let token = rest[start + 2..end].trim();

        match token {
            "document" => {
                let content = sources.active_document().ok_or_else(|| {
                    Error::parse("active document", "no document is currently open")
                })?;
                out.push_str(&content);
            }
            "clipboard" => {
                let content = sources
                    .clipboard()
                    .ok_or_else(|| Error::parse("clipboard", "clipboard is empty"))?;
                out.push_str(&content);
            }
            t if t.starts_with(RESOURCE_PREFIX) => {
                let uri = t[RESOURCE_PREFIX.len()..].trim();
                let content = registry.read_resource(uri).await.map_err(|e| {
                    Error::parse(format!("resource '{}'", uri), e.to_string())
                })?;
                out.push_str(&content);
            }
            _ => {
                // Not one of ours; keep verbatim.
                out.push_str(&rest[start..end + 2]);
            }
        }
        rest = &rest[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_agent_token() {
        let parsed = parse("/agent Summarize the attached page");
        assert_eq!(parsed.mode, Some(ProcessingMode::Agent));
        assert_eq!(parsed.clean_prompt, "Summarize the attached page");
        assert_eq!(parsed.original_prompt, "/agent Summarize the attached page");
    }

    #[test]
    fn test_parse_short_aliases() {
        assert_eq!(parse("/a do it").mode, Some(ProcessingMode::Agent));
        assert_eq!(parse("/c do it").mode, Some(ProcessingMode::Chat));
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        let parsed = parse("/AGENT find the answer");
        assert_eq!(parsed.mode, Some(ProcessingMode::Agent));
        assert_eq!(parsed.clean_prompt, "find the answer");
    }

    #[test]
    fn test_parse_spans_multiple_lines() {
        let parsed = parse("/chat\nline one\nline two");
        assert_eq!(parsed.mode, Some(ProcessingMode::Chat));
        assert_eq!(parsed.clean_prompt, "line one\nline two");
    }

    #[test]
    fn test_parse_token_only_yields_empty_prompt() {
        let parsed = parse("/agent");
        assert_eq!(parsed.mode, Some(ProcessingMode::Agent));
        assert_eq!(parsed.clean_prompt, "");
    }

    #[test]
    fn test_unrecognized_slash_word_is_plain_text() {
        let parsed = parse("/summarize this page");
        assert_eq!(parsed.mode, None);
        assert_eq!(parsed.clean_prompt, "/summarize this page");
    }

    #[test]
    fn test_token_not_at_start_is_plain_text() {
        let parsed = parse("please /agent this");
        assert_eq!(parsed.mode, None);
        assert_eq!(parsed.clean_prompt, "please /agent this");
    }

    #[test]
    fn test_no_token_trims_input() {
        let parsed = parse("   hello world  ");
        assert_eq!(parsed.mode, None);
        assert_eq!(parsed.clean_prompt, "hello world");
    }

    #[test]
    fn test_effective_mode_prefers_override() {
        assert_eq!(
            effective_mode("/agent go", ProcessingMode::Chat),
            ProcessingMode::Agent
        );
        assert_eq!(
            effective_mode("/chat go", ProcessingMode::Agent),
            ProcessingMode::Chat
        );
        assert_eq!(
            effective_mode("just a prompt", ProcessingMode::Agent),
            ProcessingMode::Agent
        );
        assert_eq!(
            effective_mode("just a prompt", ProcessingMode::Chat),
            ProcessingMode::Chat
        );
    }

    // ------------------------------------------------------------------------
    // Substitution
    // ------------------------------------------------------------------------

    struct FixedSources {
        document: Option<String>,
        clipboard: Option<String>,
    }

    impl PromptSources for FixedSources {
        fn active_document(&self) -> Option<String> {
            self.document.clone()
        }

        fn clipboard(&self) -> Option<String> {
            self.clipboard.clone()
        }
    }

    fn empty_registry() -> ToolRegistry {
        struct NeverLaunch;

        #[async_trait::async_trait]
        impl skein_mcp::ServerLauncher for NeverLaunch {
            async fn launch(
                &self,
                _config: &skein_core::config::ToolServerConfig,
            ) -> anyhow::Result<Box<dyn skein_mcp::ServerTransport>> {
                anyhow::bail!("no servers in this test")
            }
        }

        ToolRegistry::new(
            Vec::new(),
            Box::new(NeverLaunch),
            std::time::Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_expand_document_token() {
        let sources = FixedSources {
            document: Some("DOC BODY".into()),
            clipboard: None,
        };
        let out = expand_tokens("Summarize: {{document}} please", &sources, &empty_registry())
            .await
            .unwrap();
        assert_eq!(out, "Summarize: DOC BODY please");
    }

    #[tokio::test]
    async fn test_missing_document_fails_with_named_source() {
        let sources = FixedSources {
            document: None,
            clipboard: None,
        };
        let err = expand_tokens("Summarize: {{document}}", &sources, &empty_registry())
            .await
            .unwrap_err();
        match err {
            Error::Parse { source_name, .. } => assert_eq!(source_name, "active document"),
            other => panic!("Expected Parse error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_clipboard_fails() {
        let sources = FixedSources {
            document: Some("doc".into()),
            clipboard: None,
        };
        let err = expand_tokens("{{clipboard}}", &sources, &empty_registry())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[tokio::test]
    async fn test_failure_produces_no_partial_substitution() {
        let sources = FixedSources {
            document: Some("doc".into()),
            clipboard: None,
        };
        // First token resolvable, second not — the whole pass must fail.
        let result = expand_tokens("{{document}} {{clipboard}}", &sources, &empty_registry()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unrecognized_braces_pass_through() {
        let out = expand_tokens("keep {{this}} as-is", &NoSources, &empty_registry())
            .await
            .unwrap();
        assert_eq!(out, "keep {{this}} as-is");
    }

    #[tokio::test]
    async fn test_unterminated_marker_is_plain_text() {
        let out = expand_tokens("an open {{document brace", &NoSources, &empty_registry())
            .await
            .unwrap();
        assert_eq!(out, "an open {{document brace");
    }

    #[tokio::test]
    async fn test_unknown_resource_fails_with_uri_in_source() {
        let err = expand_tokens(
            "read {{resource:mem://notes/1}}",
            &NoSources,
            &empty_registry(),
        )
        .await
        .unwrap_err();
        match err {
            Error::Parse { source_name, .. } => {
                assert!(source_name.contains("mem://notes/1"));
            }
            other => panic!("Expected Parse error, got {:?}", other),
        }
    }
}
