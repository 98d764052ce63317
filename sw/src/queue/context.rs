//! Dependency context assembly
//!
//! When a task becomes ready, the outputs of its completed dependencies are
//! concatenated into a context block for the worker prompt. Each dependency
//! output is truncated to a configured cap; truncation prefers lines that
//! mention files or concrete creation work, because those are what the
//! downstream task needs to build on.

use crate::domain::PartialContext;

/// Verbs that mark a line as reporting concrete work
const CREATION_VERBS: &[&str] = &[
    "created", "wrote", "added", "implemented", "modified", "updated", "generated", "defined", "exported",
];

/// Truncate a dependency output to `max_len`, keeping file-mentioning and
/// creation-verb lines first, then filling with the leading lines
pub fn truncate_output(output: &str, max_len: usize) -> String {
    if output.len() <= max_len {
        return output.to_string();
    }

    let mut kept = String::new();

    // First pass: lines that name files or concrete work
    for line in output.lines() {
        if !mentions_artifact(line) {
            continue;
        }
        if kept.len() + line.len() + 1 > max_len {
            break;
        }
        kept.push_str(line);
        kept.push('\n');
    }

    // Second pass: fill remaining room with the opening lines
    for line in output.lines() {
        if mentions_artifact(line) {
            continue;
        }
        if kept.len() + line.len() + 1 > max_len {
            break;
        }
        kept.push_str(line);
        kept.push('\n');
    }

    if kept.is_empty() {
        // Single enormous line: hard cut
        let cut = output
            .char_indices()
            .take_while(|(i, _)| *i < max_len)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        kept = output[..cut].to_string();
    }

    kept.trim_end().to_string()
}

fn mentions_artifact(line: &str) -> bool {
    let lower = line.to_lowercase();
    if CREATION_VERBS.iter().any(|v| lower.contains(v)) {
        return true;
    }
    // Path-ish tokens: contain a slash or a dot-extension
    line.split_whitespace().any(|tok| {
        tok.contains('/')
            || tok
                .rsplit_once('.')
                .map(|(base, ext)| {
                    !base.is_empty() && !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric())
                })
                .unwrap_or(false)
    })
}

/// Build the dependency context for a fully satisfied task
pub fn build_full_context(dep_outputs: &[(String, String)], max_len_per_dep: usize) -> Option<String> {
    if dep_outputs.is_empty() {
        return None;
    }

    let mut ctx = String::from("## Outputs from completed dependencies\n\n");
    for (dep_id, output) in dep_outputs {
        ctx.push_str(&format!("### {}\n", dep_id));
        ctx.push_str(&truncate_output(output, max_len_per_dep));
        ctx.push_str("\n\n");
    }
    Some(ctx.trim_end().to_string())
}

/// Build the degraded context for a task rescued under the
/// partial-dependency policy: a warning banner plus what did complete
pub fn build_partial_context(
    partial: &PartialContext,
    dep_outputs: &[(String, String)],
    max_len_per_dep: usize,
) -> String {
    let mut ctx = String::new();
    ctx.push_str(&format!(
        "## WARNING: degraded inputs\n\nThe following dependencies FAILED or were skipped: {}.\n\
         Only {:.0}% of this task's inputs are available. Work with what exists,\n\
         note gaps explicitly, and do not fabricate missing results.\n\n",
        partial.failed.join(", "),
        partial.ratio * 100.0
    ));

    ctx.push_str("## Outputs from the dependencies that completed\n\n");
    for (dep_id, output) in dep_outputs {
        ctx.push_str(&format!("### {}\n", dep_id));
        ctx.push_str(&truncate_output(output, max_len_per_dep));
        ctx.push_str("\n\n");
    }

    ctx.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_output_untouched() {
        let out = truncate_output("short output", 100);
        assert_eq!(out, "short output");
    }

    #[test]
    fn test_truncation_prefers_artifact_lines() {
        let output = format!(
            "{}\ncreated src/auth/mod.rs with the session type\n{}",
            "filler thinking text ".repeat(40),
            "more filler ".repeat(40),
        );
        let truncated = truncate_output(&output, 120);
        assert!(truncated.contains("created src/auth/mod.rs"));
        assert!(truncated.len() <= 120);
    }

    #[test]
    fn test_truncation_single_long_line() {
        let output = "x".repeat(5000);
        let truncated = truncate_output(&output, 100);
        assert_eq!(truncated.len(), 100);
    }

    #[test]
    fn test_mentions_artifact() {
        assert!(mentions_artifact("wrote the parser"));
        assert!(mentions_artifact("see src/lib.rs for details"));
        assert!(mentions_artifact("config.yaml now has a workers section"));
        assert!(!mentions_artifact("thinking about the problem"));
        // A sentence-ending period is not a file extension
        assert!(!mentions_artifact("this is done."));
    }

    #[test]
    fn test_full_context_lists_all_deps() {
        let outputs = vec![
            ("impl-a".to_string(), "implemented module a".to_string()),
            ("impl-b".to_string(), "implemented module b".to_string()),
        ];
        let ctx = build_full_context(&outputs, 500).unwrap();
        assert!(ctx.contains("### impl-a"));
        assert!(ctx.contains("implemented module a"));
        assert!(ctx.contains("### impl-b"));
    }

    #[test]
    fn test_partial_context_has_warning_banner() {
        let partial = PartialContext {
            succeeded: vec!["a".to_string(), "b".to_string()],
            failed: vec!["c".to_string()],
            ratio: 2.0 / 3.0,
        };
        let outputs = vec![
            ("a".to_string(), "output a".to_string()),
            ("b".to_string(), "output b".to_string()),
        ];
        let ctx = build_partial_context(&partial, &outputs, 500);
        assert!(ctx.contains("WARNING: degraded inputs"));
        assert!(ctx.contains("c"));
        assert!(ctx.contains("67%"));
        assert!(ctx.contains("output a"));
        assert!(ctx.contains("output b"));
    }
}
