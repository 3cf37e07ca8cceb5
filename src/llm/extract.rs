//! Response parsers for the untrusted LLM output
//!
//! The model is a stochastic worker: every extractor here tolerates noise
//! around the payload. File blocks are pulled with a single regex pass; JSON
//! is salvaged from surrounding prose by scanning candidate end positions;
//! summaries fall back through marker lines, leading lines, and a raw prefix.

use anyhow::{bail, Result};
use regex::Regex;
use std::sync::LazyLock;

/// `### FILE: <path>` followed by a fenced block. The language tag after the
/// opening fence is ignored; content runs lazily to the next closing fence.
static FILE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"### FILE: ([^\n]+)\n+```[^\n]*\n((?s:.*?))```").expect("static file-block regex")
});

/// Extract every `(path, content)` pair, non-overlapping, left to right.
pub fn extract_file_blocks(response: &str) -> Vec<(String, String)> {
    FILE_BLOCK
        .captures_iter(response)
        .map(|cap| (cap[1].trim().to_string(), cap[2].to_string()))
        .collect()
}

/// Render a `(path, content)` set back into the block grammar. Used by the
/// role instructions shown to the model and by round-trip tests.
pub fn render_file_block(path: &str, content: &str) -> String {
    format!("### FILE: {path}\n```\n{content}```")
}

/// Parse a JSON value out of a response that may wrap it in prose.
///
/// Three stages: the whole trimmed response; then, from the first `{` or `[`,
/// candidate slices ending at each matching closer scanned from the end
/// backwards; finally an error carrying a prefix of what was received.
pub fn extract_json(response: &str) -> Result<serde_json::Value> {
    let trimmed = response.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    let obj = trimmed.find('{');
    let arr = trimmed.find('[');
    let start = match (obj, arr) {
        (Some(o), Some(a)) => Some(o.min(a)),
        (Some(o), None) => Some(o),
        (None, Some(a)) => Some(a),
        (None, None) => None,
    };

    if let Some(start) = start {
        let closer = if trimmed.as_bytes()[start] == b'{' { b'}' } else { b']' };
        let bytes = trimmed.as_bytes();
        for end in (start..bytes.len()).rev() {
            if bytes[end] != closer {
                continue;
            }
            if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                return Ok(value);
            }
        }
    }

    let prefix: String = trimmed.chars().take(200).collect();
    bail!("no parseable JSON in response: {prefix}")
}

/// Lines whose presence marks the start of the human-readable summary.
const SUMMARY_MARKERS: &[&str] = &["summary:", "findings:", "criteria:"];

/// Pull a short summary out of a raw agent response.
///
/// From the first marker line forward, capture until a fenced code block
/// begins; without a marker, take the first five non-empty lines. Captures of
/// ten characters or fewer fall back to a tagged 500-character prefix.
pub fn extract_summary(response: &str) -> String {
    let lines: Vec<&str> = response.lines().collect();
    let marker_at = lines.iter().position(|line| {
        let lower = line.to_lowercase();
        SUMMARY_MARKERS.iter().any(|m| lower.contains(m))
    });

    let captured = match marker_at {
        Some(start) => lines[start..]
            .iter()
            .take_while(|line| !line.trim_start().starts_with("```"))
            .copied()
            .collect::<Vec<_>>()
            .join("\n"),
        None => lines
            .iter()
            .filter(|line| !line.trim().is_empty())
            .take(5)
            .copied()
            .collect::<Vec<_>>()
            .join("\n"),
    };

    let captured = captured.trim().to_string();
    if captured.chars().count() > 10 {
        return captured;
    }

    let prefix: String = response.chars().take(500).collect();
    format!("{prefix}... [truncated]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_blocks_extract_in_order() {
        let response = "intro\n### FILE: src/a.js\n```js\nconst a = 1;\n```\nmiddle\n### FILE: b.txt\n```\nhello\n```\n";
        let blocks = extract_file_blocks(response);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].0, "src/a.js");
        assert_eq!(blocks[0].1, "const a = 1;\n");
        assert_eq!(blocks[1].0, "b.txt");
        assert_eq!(blocks[1].1, "hello\n");
    }

    #[test]
    fn file_block_round_trip_reproduces_the_mapping() {
        let files = vec![
            ("src/index.js".to_string(), "console.log(1);\n".to_string()),
            ("progress.txt".to_string(), "PROMISE_MET\n".to_string()),
        ];
        let rendered: String = files
            .iter()
            .map(|(p, c)| render_file_block(p, c))
            .collect::<Vec<_>>()
            .join("\n\n");
        assert_eq!(extract_file_blocks(&rendered), files);
    }

    #[test]
    fn lang_tag_on_the_fence_is_ignored() {
        let blocks = extract_file_blocks("### FILE: x.ts\n```typescript\nlet x = 1;\n```");
        assert_eq!(blocks[0].1, "let x = 1;\n");
    }

    #[test]
    fn json_whole_response_parses_directly() {
        let value = extract_json(r#"  {"a": 1}  "#).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn json_is_salvaged_from_surrounding_prose() {
        let value = extract_json("Here is the plan:\n[{\"title\": \"t\"}]\nHope this helps!").unwrap();
        assert_eq!(value[0]["title"], "t");
    }

    #[test]
    fn json_salvage_prefers_the_outermost_closer() {
        // The trailing prose contains a stray closer; the scan from the end
        // must keep walking back until a parse succeeds.
        let value = extract_json("{\"a\": {\"b\": 2}} trailing }").unwrap();
        assert_eq!(value["a"]["b"], 2);
    }

    #[test]
    fn json_failure_carries_a_prefix() {
        let err = extract_json("not json at all").unwrap_err();
        assert!(err.to_string().contains("not json at all"));
    }

    #[test]
    fn json_extractor_round_trips_generated_documents() {
        let original = serde_json::json!({
            "stages": [{"name": "s", "stories": [{"title": "t", "passes": false}]}]
        });
        let noisy = format!("Sure!\n{}\nDone.", serde_json::to_string_pretty(&original).unwrap());
        assert_eq!(extract_json(&noisy).unwrap(), original);
    }

    #[test]
    fn summary_starts_at_marker_and_stops_at_fence() {
        let response = "preamble\nSummary: added the login form\nwith validation\n```js\ncode\n```";
        let summary = extract_summary(response);
        assert!(summary.starts_with("Summary: added the login form"));
        assert!(summary.contains("with validation"));
        assert!(!summary.contains("code"));
    }

    #[test]
    fn summary_without_marker_takes_first_five_nonempty_lines() {
        let response = "one\n\ntwo\nthree\nfour\nfive\nsix";
        let summary = extract_summary(response);
        assert!(summary.contains("five"));
        assert!(!summary.contains("six"));
    }

    #[test]
    fn tiny_captures_fall_back_to_a_tagged_prefix() {
        let summary = extract_summary("ok");
        assert!(summary.ends_with("... [truncated]"));
    }
}
