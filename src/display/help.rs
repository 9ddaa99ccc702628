//! Custom help formatting for consistent CLI display.

use crate::display::theme::THEME;

/// Format help text with consistent styling
pub fn format_help_section(title: &str, content: &str, indent: bool) -> String {
    let mut output = String::new();

    output.push_str(&format!("{}\n", THEME.apply(&THEME.header, title)));

    for line in content.lines() {
        if line.trim().is_empty() {
            output.push('\n');
        } else if indent && !line.starts_with("    ") {
            output.push_str(&format!("    {line}\n"));
        } else {
            output.push_str(&format!("{line}\n"));
        }
    }

    output
}

/// Text shown after the command list in `--help`.
pub fn create_help_text() -> String {
    let mut help = String::new();

    let quick_start = r#"$ shardvec init                       # Write .shardvec/settings.toml
$ shardvec ingest notes.txt --progress  # One record per line
$ shardvec search "vector similarity"   # Top-k across all shards"#;

    help.push_str(&format_help_section("QUICK START", quick_start, true));
    help.push('\n');

    let examples = r#"# Tag records while streaming (tab-separated)
$ SHARDVEC_INGEST__METADATA_DELIMITER=$'\t' shardvec ingest tagged.tsv

# Exhaustive metrics scan every stored vector
$ shardvec search "raspberry pi" --metric euclidean -k 10

# Accept results from healthy shards if one fails
$ shardvec search "embedding" --deadline-ms 50 --allow-partial

# Trade precision for memory
$ shardvec quantize --bits 8
$ shardvec stats"#;

    help.push_str(&format_help_section("EXAMPLES", examples, true));

    help
}
