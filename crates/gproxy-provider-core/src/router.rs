//! The model router (§4.1): a deterministic, pure function from the raw
//! `model` string on an incoming request to `(provider, model, reasoning)`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasoningLevel {
    Low,
    Medium,
    High,
    XHigh,
}

impl ReasoningLevel {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "xhigh" => Some(Self::XHigh),
            _ => None,
        }
    }
}

impl fmt::Display for ReasoningLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::XHigh => "xhigh",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderTag {
    PassthroughAnthropic,
    PassthroughGlm,
    OpenAiKey,
    OpenRouter,
    GeminiKey,
    GeminiOAuth,
    CodexOAuth,
}

impl ProviderTag {
    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_lowercase().as_str() {
            "passthrough-anthropic" | "anthropic" => Some(Self::PassthroughAnthropic),
            "passthrough-glm" => Some(Self::PassthroughGlm),
            "openai-key" | "openai" => Some(Self::OpenAiKey),
            "openrouter" => Some(Self::OpenRouter),
            "gemini-key" | "gemini" => Some(Self::GeminiKey),
            "gemini-oauth" => Some(Self::GeminiOAuth),
            "codex-oauth" | "codex" => Some(Self::CodexOAuth),
            _ => None,
        }
    }

    /// Whether this upstream is already Protocol-A native (§4.7); used by
    /// the gateway to decide whether to update the active-selection cell
    /// and whether to run the vision fallback.
    pub fn is_passthrough(&self) -> bool {
        matches!(self, Self::PassthroughAnthropic | Self::PassthroughGlm)
    }

    /// Whether this upstream accepts inline image blocks natively. The
    /// ChatGPT-backed Responses API (§4.6.1) does not expose an image
    /// input channel on this gateway's input-item encoding, so Codex
    /// requests always run through the vision fallback (§4.8) first.
    pub fn supports_images(&self) -> bool {
        !matches!(self, Self::CodexOAuth)
    }
}

impl fmt::Display for ProviderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PassthroughAnthropic => "passthrough-anthropic",
            Self::PassthroughGlm => "passthrough-glm",
            Self::OpenAiKey => "openai-key",
            Self::OpenRouter => "openrouter",
            Self::GeminiKey => "gemini-key",
            Self::GeminiOAuth => "gemini-oauth",
            Self::CodexOAuth => "codex-oauth",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Selection {
    pub provider: ProviderTag,
    pub model: String,
    pub reasoning: Option<ReasoningLevel>,
}

/// The newer of the two alias tables the source carries (§9 open
/// questions): it is the one that knows about the Codex and Gemini OAuth
/// shortcuts, so it is the one this router implements.
const ALIAS_TABLE: &[(&str, &str)] = &[
    ("opus", "claude-opus-4-5"),
    ("sonnet", "claude-sonnet-4-5"),
    ("haiku", "claude-haiku-4-5"),
    ("glm", "glm-4.6"),
    ("glm-air", "glm-4.6-air"),
    ("codex", "codex-oauth:gpt-5.3-codex"),
    ("codex-api", "openai-key:gpt-5.3-codex"),
    ("gpt", "openai-key:gpt-5.3"),
    ("gemini", "gemini-oauth:gemini-3-pro-preview"),
    ("gemini-flash", "gemini-oauth:gemini-3-flash-preview"),
    ("gemini-api", "gemini-key:gemini-3-pro-preview"),
    ("kimi", "openrouter:moonshotai/kimi-k2"),
];

fn lookup_alias(name: &str) -> Option<&'static str> {
    let needle = name.to_ascii_lowercase();
    ALIAS_TABLE
        .iter()
        .find(|(key, _)| *key == needle)
        .map(|(_, target)| *target)
}

/// Parses the raw `model` string into `(provider, model, reasoning)`,
/// falling back to `default_selection` (the active-selection cell, see
/// §3 invariant 4) when the string carries no provider information, and
/// finally to `(passthrough-glm, <raw string>)` when there is no default
/// either (§4.1 step 6).
pub fn parse_model(raw: &str, default_selection: Option<&Selection>) -> Selection {
    let (body, reasoning) = strip_reasoning_suffix(raw);

    let resolved = lookup_alias(body).unwrap_or(body);

    if let Some(rest) = strip_ci_prefix(resolved, "claude-") {
        let _ = rest;
        return Selection {
            provider: ProviderTag::PassthroughAnthropic,
            model: resolved.to_string(),
            reasoning,
        };
    }
    if let Some(rest) = strip_ci_prefix(resolved, "glm-") {
        let _ = rest;
        return Selection {
            provider: ProviderTag::PassthroughGlm,
            model: resolved.to_string(),
            reasoning,
        };
    }

    if let Some((left, right)) = split_provider_prefix(resolved)
        && let Some(provider) = ProviderTag::from_prefix(left)
    {
        return Selection {
            provider,
            model: right.to_string(),
            reasoning,
        };
    }

    if let Some(default) = default_selection {
        return Selection {
            provider: default.provider,
            model: default.model.clone(),
            reasoning: reasoning.or(default.reasoning),
        };
    }

    Selection {
        provider: ProviderTag::PassthroughGlm,
        model: resolved.to_string(),
        reasoning,
    }
}

/// Strips a terminal `@low|medium|high|xhigh` suffix. An unrecognized
/// `@foo` is left untouched, per the router's testable property.
fn strip_reasoning_suffix(raw: &str) -> (&str, Option<ReasoningLevel>) {
    if let Some(at) = raw.rfind('@') {
        let (body, suffix) = raw.split_at(at);
        let suffix = &suffix[1..];
        if let Some(level) = ReasoningLevel::parse(suffix) {
            return (body, Some(level));
        }
    }
    (raw, None)
}

fn strip_ci_prefix<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    if value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}

/// Splits on the first `:` or `/`, whichever comes first.
fn split_provider_prefix(value: &str) -> Option<(&str, &str)> {
    let colon = value.find(':');
    let slash = value.find('/');
    let at = match (colon, slash) {
        (Some(c), Some(s)) => Some(c.min(s)),
        (Some(c), None) => Some(c),
        (None, Some(s)) => Some(s),
        (None, None) => None,
    }?;
    Some((&value[..at], &value[at + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_known_reasoning_suffix() {
        let a = parse_model("codex-api:gpt-5.3@low", None);
        assert_eq!(a.reasoning, Some(ReasoningLevel::Low));
        assert_eq!(a.model, "gpt-5.3");
    }

    #[test]
    fn unknown_at_suffix_is_not_stripped() {
        let a = parse_model("openai-key:gpt-5.3@foo", None);
        assert_eq!(a.reasoning, None);
        assert_eq!(a.model, "gpt-5.3@foo");
    }

    #[test]
    fn claude_prefix_is_anthropic_passthrough() {
        let a = parse_model("claude-opus-4-5", None);
        assert_eq!(a.provider, ProviderTag::PassthroughAnthropic);
    }

    #[test]
    fn glm_prefix_is_glm_passthrough() {
        let a = parse_model("glm-4.6", None);
        assert_eq!(a.provider, ProviderTag::PassthroughGlm);
    }

    #[test]
    fn alias_expands_to_codex_oauth() {
        let a = parse_model("codex@low", None);
        assert_eq!(a.provider, ProviderTag::CodexOAuth);
        assert_eq!(a.model, "gpt-5.3-codex");
        assert_eq!(a.reasoning, Some(ReasoningLevel::Low));
    }

    #[test]
    fn provider_colon_model_splits_on_first_occurrence() {
        let a = parse_model("gemini-oauth:gemini-3-pro:extra", None);
        assert_eq!(a.provider, ProviderTag::GeminiOAuth);
        assert_eq!(a.model, "gemini-3-pro:extra");
    }

    #[test]
    fn unknown_string_falls_back_to_default_selection() {
        let default = Selection {
            provider: ProviderTag::CodexOAuth,
            model: "gpt-5.3-codex".to_string(),
            reasoning: Some(ReasoningLevel::High),
        };
        let a = parse_model("some-internal-task-model", Some(&default));
        assert_eq!(a.provider, ProviderTag::CodexOAuth);
        assert_eq!(a.model, "gpt-5.3-codex");
        assert_eq!(a.reasoning, Some(ReasoningLevel::High));
    }

    #[test]
    fn suffix_reasoning_overrides_default_carried_level() {
        let default = Selection {
            provider: ProviderTag::CodexOAuth,
            model: "gpt-5.3-codex".to_string(),
            reasoning: Some(ReasoningLevel::High),
        };
        let a = parse_model("some-internal-task-model@low", Some(&default));
        assert_eq!(a.reasoning, Some(ReasoningLevel::Low));
    }

    #[test]
    fn no_default_falls_back_to_glm_passthrough_with_raw_string() {
        let a = parse_model("mystery-model", None);
        assert_eq!(a.provider, ProviderTag::PassthroughGlm);
        assert_eq!(a.model, "mystery-model");
    }

    #[test]
    fn alias_resolves_in_one_pass_idempotently() {
        // parse(alias.target) produces the same (provider, model) as parse(alias.key)
        let via_alias = parse_model("codex", None);
        let via_target = parse_model("codex-oauth:gpt-5.3-codex", None);
        assert_eq!(via_alias.provider, via_target.provider);
        assert_eq!(via_alias.model, via_target.model);
    }
}
