//! Dotenv-style config loading (§4.2, §6) and the config/data directory
//! the rest of the gateway's filesystem state (§6) lives under.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Resolves the config directory: `CLAUDE_PROXY_CONFIG_DIR` if set,
/// otherwise `~/.claude-proxy` (§6).
pub fn resolve_config_dir(cli_override: Option<&str>) -> PathBuf {
    if let Some(value) = cli_override
        && !value.trim().is_empty()
    {
        return PathBuf::from(value);
    }
    if let Ok(value) = std::env::var("CLAUDE_PROXY_CONFIG_DIR")
        && !value.trim().is_empty()
    {
        return PathBuf::from(value);
    }
    dirs::home_dir()
        .map(|home| home.join(".claude-proxy"))
        .unwrap_or_else(|| PathBuf::from(".claude-proxy"))
}

/// Parses a `.env`-style file into a flat key/value map. Lines that are
/// blank, start with `#`, or carry no `=` are skipped; surrounding single
/// or double quotes around the value are stripped, matching the handful
/// of hand-edited `.env` files this gateway reads (§6's enumerated key
/// list, not a generic env-file grammar).
pub fn parse_dotenv(contents: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = unquote(value.trim());
        out.insert(key.to_string(), value);
    }
    out
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

/// Loads `<config_dir>/.env`. A missing file is not an error: every key
/// is optional at this layer, required-ness is decided per adapter when
/// it asks the credential store for a specific key (§4.2).
pub fn load_env_file(config_dir: &Path) -> HashMap<String, String> {
    let path = config_dir.join(".env");
    match std::fs::read_to_string(&path) {
        Ok(contents) => parse_dotenv(&contents),
        Err(_) => HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_key_value_pairs() {
        let parsed = parse_dotenv("OPENAI_API_KEY=sk-abc123\nCLAUDE_PROXY_PORT=17870\n");
        assert_eq!(parsed.get("OPENAI_API_KEY").map(String::as_str), Some("sk-abc123"));
        assert_eq!(parsed.get("CLAUDE_PROXY_PORT").map(String::as_str), Some("17870"));
    }

    #[test]
    fn skips_blank_lines_and_comments() {
        let parsed = parse_dotenv("# a comment\n\nGEMINI_API_KEY=xyz\n");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.get("GEMINI_API_KEY").map(String::as_str), Some("xyz"));
    }

    #[test]
    fn strips_surrounding_quotes() {
        let parsed = parse_dotenv("OPENROUTER_TITLE=\"claude proxy\"\nVISION_MODEL='some/model'\n");
        assert_eq!(parsed.get("OPENROUTER_TITLE").map(String::as_str), Some("claude proxy"));
        assert_eq!(parsed.get("VISION_MODEL").map(String::as_str), Some("some/model"));
    }

    #[test]
    fn handles_export_prefixed_lines() {
        let parsed = parse_dotenv("export ANTHROPIC_API_KEY=sk-ant-1\n");
        assert_eq!(parsed.get("ANTHROPIC_API_KEY").map(String::as_str), Some("sk-ant-1"));
    }
}
