// ABOUTME: Canonical tool vocabulary plus the two display renderers backends share
// ABOUTME: Open synonym registry; renderers are total - any (name, input) pair yields a string

use serde_json::Value;
use std::collections::HashMap;

/// How many characters of a path, command, or query make it into a summary.
const SUMMARY_BUDGET: usize = 40;

/// Maps each backend's tool-call vocabulary onto one canonical set.
///
/// New backends keep inventing names for the same operations, so this is a
/// registry, not an enum: `register` extends it at runtime. Lookups are
/// case-insensitive; canonical names resolve to themselves.
pub struct ToolCatalog {
    synonyms: HashMap<String, String>,
}

impl Default for ToolCatalog {
    fn default() -> Self {
        let base: &[(&str, &str)] = &[
            // File operations
            ("read_file", "Read"),
            ("read", "Read"),
            ("recall_memory", "Read"),
            ("write_file", "Write"),
            ("write", "Write"),
            ("create_file", "Write"),
            ("edit_file", "Edit"),
            ("str_replace_editor", "Edit"),
            ("replace", "Edit"),
            ("edit", "Edit"),
            ("multiedit", "MultiEdit"),
            ("delete", "Delete"),
            // Terminal operations
            ("shell", "Bash"),
            ("bash", "Bash"),
            ("run_terminal_command", "Bash"),
            ("execute_bash", "Bash"),
            ("execute_command", "Bash"),
            ("run_command", "Bash"),
            // Search operations
            ("search_file_content", "Grep"),
            ("codebase_search", "Grep"),
            ("grep", "Grep"),
            ("search_files", "Grep"),
            ("search_in_file", "Grep"),
            ("file_search", "Grep"),
            ("find_files", "Glob"),
            ("glob", "Glob"),
            ("list_directory", "LS"),
            ("list_dir", "LS"),
            ("list_files", "LS"),
            ("directory_listing", "LS"),
            ("ls", "LS"),
            ("semsearch", "SemSearch"),
            // Web operations
            ("google_web_search", "WebSearch"),
            ("web_search", "WebSearch"),
            ("websearch", "WebSearch"),
            ("web_fetch", "WebFetch"),
            ("webfetch", "WebFetch"),
            // Task/memory operations
            ("save_memory", "SaveMemory"),
            ("savememory", "SaveMemory"),
            ("todowrite", "TodoWrite"),
            ("task", "Task"),
            ("exitplanmode", "ExitPlanMode"),
            ("notebookedit", "NotebookEdit"),
        ];

        let synonyms = base
            .iter()
            .map(|(raw, canonical)| ((*raw).to_string(), (*canonical).to_string()))
            .collect();

        Self { synonyms }
    }
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register another backend's name for a canonical tool.
    pub fn register(&mut self, synonym: &str, canonical: &str) {
        self.synonyms
            .insert(synonym.to_ascii_lowercase(), canonical.to_string());
    }

    /// Resolve a raw tool name to its canonical form. Unknown names pass
    /// through unchanged so new vocabulary still renders.
    pub fn canonical(&self, raw: &str) -> String {
        self.synonyms
            .get(&raw.to_ascii_lowercase())
            .cloned()
            .unwrap_or_else(|| raw.to_string())
    }

    /// One short present-participle line for live status display.
    pub fn clean_display(&self, raw: &str, input: &Value) -> String {
        match self.canonical(raw).as_str() {
            "Read" => match file_name(input) {
                Some(name) => format!("Reading {name}"),
                None => "Reading file".to_string(),
            },
            "Write" => match file_name(input) {
                Some(name) => format!("Writing {name}"),
                None => "Writing file".to_string(),
            },
            "Edit" | "MultiEdit" => match file_name(input) {
                Some(name) => format!("Editing {name}"),
                None => "Editing file".to_string(),
            },
            "Bash" => match command_field(input).and_then(|c| first_word(&c)) {
                Some(word) => format!("Running {word}"),
                None => "Running command".to_string(),
            },
            "LS" => "Listing directory".to_string(),
            "TodoWrite" => "Planning next steps".to_string(),
            "WebSearch" => match query_field(input) {
                Some(q) => format!("Searching: {}...", truncate_chars(&q, 50)),
                None => "Web search".to_string(),
            },
            "WebFetch" => match str_field(input, &["url"]) {
                Some(url) => format!("Fetching from {}", domain_of(&url)),
                None => "Fetching web content".to_string(),
            },
            _ => format!("Using {raw}"),
        }
    }

    /// Markdown-flavored one-liner used as persisted message content.
    /// Total: unknown tools fall back to the generic executing form, and no
    /// input shape (missing fields, non-object, null) can make it fail.
    pub fn summary(&self, raw: &str, input: &Value) -> String {
        let canonical = self.canonical(raw);
        match canonical.as_str() {
            "Read" | "Write" | "Edit" | "MultiEdit" | "Delete" => match file_field(input) {
                Some(path) => format!("**{canonical}** `{}`", shorten_path(&path)),
                None => format!("**{canonical}** `file`"),
            },
            "Bash" => match command_field(input) {
                Some(cmd) => format!("**Bash** `{}`", truncate_with_ellipsis(&cmd)),
                None => "**Bash** `command`".to_string(),
            },
            "TodoWrite" => "`Planning for next moves...`".to_string(),
            "SaveMemory" => match str_field(input, &["fact"]) {
                Some(fact) => format!("**SaveMemory** `{}`", truncate_with_ellipsis(&fact)),
                None => "**SaveMemory** `storing information`".to_string(),
            },
            "Grep" => {
                let pattern = str_field(input, &["pattern", "query", "search"]);
                let path = str_field(input, &["path", "file", "directory"]);
                match (pattern, path) {
                    (Some(pattern), Some(path)) => {
                        format!("**Search** `{pattern}` in `{}`", shorten_path(&path))
                    }
                    (Some(pattern), None) => format!("**Search** `{pattern}`"),
                    _ => "**Search** `pattern`".to_string(),
                }
            }
            "Glob" => match str_field(input, &["pattern", "globPattern", "name"]) {
                Some(pattern) => format!("**Glob** `{pattern}`"),
                None => "**Glob** `pattern`".to_string(),
            },
            "LS" => match str_field(input, &["path", "directory", "dir"]) {
                Some(path) => format!("**LS** `{}`", shorten_path(&path)),
                None => "**LS** `directory`".to_string(),
            },
            "SemSearch" => match query_field(input) {
                Some(q) => format!("**SemSearch** `{}`", truncate_with_ellipsis(&q)),
                None => "**SemSearch** `query`".to_string(),
            },
            "WebFetch" => {
                let url = str_field(input, &["url"]);
                let prompt = str_field(input, &["prompt"]);
                match (url, prompt) {
                    (Some(url), Some(prompt)) => format!(
                        "**WebFetch** [{}]({url})\n> {}",
                        domain_of(&url),
                        truncate_chars(&prompt, 30)
                    ),
                    (Some(url), None) => format!("**WebFetch** [{}]({url})", domain_of(&url)),
                    _ => "**WebFetch** `url`".to_string(),
                }
            }
            "WebSearch" => match str_field(input, &["query", "search_query"]) {
                Some(q) => format!("**WebSearch** `{}`", truncate_with_ellipsis(&q)),
                None => "**WebSearch** `query`".to_string(),
            },
            "Task" => {
                let description = str_field(input, &["description"]);
                let subagent = str_field(input, &["subagent_type"]);
                match (description, subagent) {
                    (Some(description), Some(subagent)) => format!(
                        "**Task** `{subagent}`\n> {}",
                        truncate_chars(&description, 50)
                    ),
                    (Some(description), None) => {
                        format!("**Task** `{}`", truncate_with_ellipsis(&description))
                    }
                    _ => "**Task** `subtask`".to_string(),
                }
            }
            "ExitPlanMode" => "**ExitPlanMode** `planning complete`".to_string(),
            "NotebookEdit" => match str_field(input, &["notebook_path"]) {
                Some(path) => format!(
                    "**NotebookEdit** `{}`",
                    path.rsplit('/').next().unwrap_or(&path)
                ),
                None => "**NotebookEdit** `notebook`".to_string(),
            },
            _ => format!("**{raw}** `executing...`"),
        }
    }
}

/// First string value among the candidate keys, skipping empty strings.
fn str_field(input: &Value, candidates: &[&str]) -> Option<String> {
    let obj = input.as_object()?;
    for key in candidates {
        if let Some(value) = obj.get(*key).and_then(|v| v.as_str()) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn file_field(input: &Value) -> Option<String> {
    str_field(input, &["file_path", "path", "file"])
}

fn command_field(input: &Value) -> Option<String> {
    str_field(input, &["command", "cmd", "script"])
}

fn query_field(input: &Value) -> Option<String> {
    str_field(input, &["query"])
}

fn file_name(input: &Value) -> Option<String> {
    file_field(input).map(|path| path.rsplit('/').next().unwrap_or(&path).to_string())
}

fn first_word(command: &str) -> Option<String> {
    command.split_whitespace().next().map(|w| w.to_string())
}

/// Keep long paths readable: past the budget, show only the last two
/// components behind an ellipsis.
fn shorten_path(path: &str) -> String {
    if path.chars().count() <= SUMMARY_BUDGET {
        return path.to_string();
    }
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if components.len() >= 2 {
        format!("…/{}", components[components.len() - 2..].join("/"))
    } else {
        format!("…{}", truncate_chars(path, SUMMARY_BUDGET))
    }
}

/// Char-safe truncation (multi-byte input must never panic).
fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

fn truncate_with_ellipsis(s: &str) -> String {
    if s.chars().count() <= SUMMARY_BUDGET {
        s.to_string()
    } else {
        format!("{}...", truncate_chars(s, SUMMARY_BUDGET))
    }
}

fn domain_of(url: &str) -> String {
    let stripped = url.split("//").last().unwrap_or(url);
    stripped.split('/').next().unwrap_or(stripped).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_maps_synonyms_case_insensitively() {
        let catalog = ToolCatalog::new();
        assert_eq!(catalog.canonical("read_file"), "Read");
        assert_eq!(catalog.canonical("Shell"), "Bash");
        assert_eq!(catalog.canonical("list_dir"), "LS");
        assert_eq!(catalog.canonical("semSearch"), "SemSearch");
    }

    #[test]
    fn canonical_is_idempotent_for_canonical_names() {
        let catalog = ToolCatalog::new();
        for name in ["Read", "Write", "Edit", "Bash", "Grep", "Glob", "LS"] {
            assert_eq!(catalog.canonical(name), name);
        }
    }

    #[test]
    fn unknown_tool_passes_through() {
        let catalog = ToolCatalog::new();
        assert_eq!(catalog.canonical("quantum_leap"), "quantum_leap");
    }

    #[test]
    fn register_extends_the_vocabulary() {
        let mut catalog = ToolCatalog::new();
        catalog.register("readFileTool", "Read");
        assert_eq!(catalog.canonical("readfiletool"), "Read");
    }

    #[test]
    fn summary_renders_edit_with_path() {
        let catalog = ToolCatalog::new();
        let out = catalog.summary("edit_file", &json!({"file_path": "src/app.rs"}));
        assert_eq!(out, "**Edit** `src/app.rs`");
    }

    #[test]
    fn summary_shortens_long_paths() {
        let catalog = ToolCatalog::new();
        let long = "/very/long/path/that/keeps/going/and/going/src/components/app.rs";
        let out = catalog.summary("Read", &json!({ "file_path": long }));
        assert_eq!(out, "**Read** `…/components/app.rs`");
    }

    #[test]
    fn summary_truncates_long_commands() {
        let catalog = ToolCatalog::new();
        let cmd = "npm install --save-dev every-package-anyone-ever-published --verbose";
        let out = catalog.summary("shell", &json!({ "command": cmd }));
        assert!(out.starts_with("**Bash** `"));
        assert!(out.contains("..."));
    }

    #[test]
    fn summary_substitutes_placeholders_for_missing_fields() {
        let catalog = ToolCatalog::new();
        assert_eq!(catalog.summary("Read", &json!({})), "**Read** `file`");
        assert_eq!(catalog.summary("Bash", &json!({})), "**Bash** `command`");
        assert_eq!(catalog.summary("Grep", &json!({})), "**Search** `pattern`");
    }

    #[test]
    fn summary_never_empty_for_any_input() {
        let catalog = ToolCatalog::new();
        let inputs = [
            json!(null),
            json!({}),
            json!([1, 2, 3]),
            json!("just a string"),
            json!({"file_path": ""}),
        ];
        for name in ["Read", "Write", "Bash", "Grep", "never_heard_of_it", ""] {
            for input in &inputs {
                assert!(
                    !catalog.summary(name, input).is_empty(),
                    "empty summary for ({name}, {input})"
                );
                assert!(
                    !catalog.clean_display(name, input).is_empty(),
                    "empty display for ({name}, {input})"
                );
            }
        }
    }

    #[test]
    fn summary_unknown_tool_uses_generic_form() {
        let catalog = ToolCatalog::new();
        assert_eq!(
            catalog.summary("quantum_leap", &json!({})),
            "**quantum_leap** `executing...`"
        );
    }

    #[test]
    fn clean_display_reads_like_a_status_line() {
        let catalog = ToolCatalog::new();
        assert_eq!(
            catalog.clean_display("read_file", &json!({"path": "src/main.rs"})),
            "Reading main.rs"
        );
        assert_eq!(
            catalog.clean_display("shell", &json!({"command": "npm install"})),
            "Running npm"
        );
        assert_eq!(
            catalog.clean_display("list_dir", &json!({})),
            "Listing directory"
        );
    }

    #[test]
    fn webfetch_summary_extracts_domain() {
        let catalog = ToolCatalog::new();
        let out = catalog.summary(
            "web_fetch",
            &json!({"url": "https://docs.rs/tokio/latest"}),
        );
        assert_eq!(out, "**WebFetch** [docs.rs](https://docs.rs/tokio/latest)");
    }

    #[test]
    fn multibyte_truncation_does_not_panic() {
        let catalog = ToolCatalog::new();
        let cmd = "🔥".repeat(120);
        let out = catalog.summary("Bash", &json!({ "command": cmd }));
        assert!(out.ends_with("...`"));
    }
}
