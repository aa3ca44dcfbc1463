//! Text signals shared by the analyzer, prioritizer and correlator:
//! file paths, code constructs, keywords, error and fix markers, tool
//! actions and fenced code blocks.
//!
//! Everything here is a cheap lexical scan over `regex_lite` patterns.
//! Markers are matched on word boundaries, so `prefix` is not a fix and
//! `ErrorBoundary` is not an error.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex_lite::Regex;

const KNOWN_EXTENSIONS: &[&str] = &[
    "py", "pyi", "rs", "js", "mjs", "cjs", "ts", "tsx", "jsx", "go", "java", "kt", "scala", "c",
    "h", "cc", "cpp", "hpp", "cs", "rb", "php", "swift", "md", "rst", "txt", "json", "yaml", "yml",
    "toml", "ini", "cfg", "conf", "env", "lock", "sh", "bash", "zsh", "sql", "html", "css", "scss",
    "xml", "gradle", "proto", "vue", "svelte", "lua", "ex", "exs",
];

const SPECIAL_FILES: &[&str] = &[
    "Dockerfile",
    "Makefile",
    "Justfile",
    "Procfile",
    "Gemfile",
    "Rakefile",
    ".env",
    ".gitignore",
    ".dockerignore",
];

const CONFIG_FILES: &[&str] = &[
    "Cargo.toml",
    "Cargo.lock",
    "package.json",
    "package-lock.json",
    "pyproject.toml",
    "requirements.txt",
    "setup.py",
    "setup.cfg",
    "go.mod",
    "go.sum",
    "tsconfig.json",
    "Dockerfile",
    "Makefile",
    "docker-compose.yml",
    "docker-compose.yaml",
    ".env",
];

const CONFIG_EXTENSIONS: &[&str] = &["toml", "yaml", "yml", "json", "ini", "cfg", "conf", "env", "lock"];

/// Error words, whole words only.
static ERROR_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:errors?|exceptions?|traceback|failed|failures?|panic|panicked|fatal|errno|stack trace|segmentation fault)\b",
    )
    .ok()
});

/// Exception class names such as `TypeError` or `IOException`.
static ERROR_TYPE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][A-Za-z0-9]*(?:Error|Exception)\b").ok());

/// Negated reports: "0 failed", "no errors", "without any exceptions".
static NEGATED_ERROR_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:0|no|zero|without)\s+(?:[a-z]+\s+)?(?:errors?|exceptions?|failures?|failed|panics?)\b",
    )
    .ok()
});

static FIX_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:fix|fixes|fixed|fixing|resolved|patched|corrected|solved|works now|passing|passes)\b",
    )
    .ok()
});

/// Scheme URLs, removed before path extraction.
static URL_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[A-Za-z][A-Za-z0-9+.\-]*://\S+").ok());

/// Path-shaped tokens; [`looks_like_path`] decides which are files.
static PATH_TOKEN_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9_.\-]*[A-Za-z0-9_.](?:/[A-Za-z0-9_.\-]+)*").ok());

static IDENT_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b[A-Za-z_][A-Za-z0-9_]*\b").ok());

static CALL_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\(").ok());

static DEF_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b(?:def|fn|func|function)\s+([A-Za-z_][A-Za-z0-9_]*)").ok());

fn is_match(re: &Option<Regex>, text: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(text))
}

fn strip<'t>(re: &Option<Regex>, text: &'t str) -> Cow<'t, str> {
    match re.as_ref() {
        Some(re) => re.replace_all(text, " "),
        None => Cow::Borrowed(text),
    }
}

const CODE_KEYWORDS: &[&str] = &[
    "if", "for", "while", "match", "return", "switch", "catch", "print", "println", "elif",
    "else", "with", "and", "or", "not", "in", "fn", "def", "func", "function", "loop", "assert",
    "typeof", "sizeof", "new",
];

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "have", "this", "that", "with", "from", "they", "will", "would",
    "there", "their", "what", "about", "which", "when", "make", "like", "just", "into", "than",
    "then", "them", "these", "some", "could", "should", "also", "been", "were", "does", "did",
    "its", "it's", "let", "now", "how", "why", "where", "here", "please", "thanks", "okay",
    "sure", "get", "got", "use", "using", "see", "need", "want", "file", "line", "code",
];

// ── Paths ─────────────────────────────────────────────────────────────────

/// File paths mentioned in `text`, deduplicated in order of appearance.
pub fn file_paths(text: &str) -> Vec<String> {
    let Some(token_re) = PATH_TOKEN_RE.as_ref() else {
        return Vec::new();
    };
    let text = strip(&URL_RE, text);
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for token in token_re.find_iter(&text) {
        let candidate = token
            .as_str()
            .trim_end_matches('.')
            .trim_start_matches("./");
        if looks_like_path(candidate) && seen.insert(candidate.to_string()) {
            out.push(candidate.to_string());
        }
    }
    out
}

fn looks_like_path(candidate: &str) -> bool {
    let name = basename(candidate);
    if SPECIAL_FILES.contains(&name) {
        return true;
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) => {
            !stem.is_empty()
                && stem.chars().all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
                && KNOWN_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
        }
        None => false,
    }
}

/// The final path component.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Everything before the final component; empty for a bare file name.
pub fn directory(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}

fn extension(path: &str) -> Option<String> {
    basename(path)
        .rsplit_once('.')
        .filter(|(stem, _)| !stem.is_empty())
        .map(|(_, ext)| ext.to_ascii_lowercase())
}

/// Coarse language family of a file, used for weak file similarity.
pub fn extension_group(path: &str) -> Option<&'static str> {
    let group = match extension(path)?.as_str() {
        "py" | "pyi" => "python",
        "rs" => "rust",
        "js" | "mjs" | "cjs" | "ts" | "tsx" | "jsx" | "vue" | "svelte" => "web",
        "go" => "go",
        "java" | "kt" | "scala" | "gradle" => "jvm",
        "c" | "h" | "cc" | "cpp" | "hpp" => "c",
        "json" | "yaml" | "yml" | "toml" | "ini" | "cfg" | "conf" | "env" | "lock" => "config",
        "md" | "rst" | "txt" => "docs",
        "sh" | "bash" | "zsh" => "shell",
        "html" | "css" | "scss" | "xml" => "markup",
        _ => return None,
    };
    Some(group)
}

/// Manifests, lock files, environment and structured config files.
pub fn is_config_file(path: &str) -> bool {
    let name = basename(path);
    CONFIG_FILES.contains(&name)
        || name.starts_with(".env")
        || extension(path).is_some_and(|ext| CONFIG_EXTENSIONS.contains(&ext.as_str()))
}

// ── Code constructs ───────────────────────────────────────────────────────

fn identifiers(text: &str) -> Vec<&str> {
    IDENT_RE
        .as_ref()
        .map(|re| re.find_iter(text).map(|m| m.as_str()).collect())
        .unwrap_or_default()
}

/// Functions called or defined in `text`, in order of appearance.
pub fn function_names(text: &str) -> Vec<String> {
    let mut found: Vec<(usize, &str)> = Vec::new();
    for re in [&*CALL_RE, &*DEF_RE] {
        let Some(re) = re.as_ref() else { continue };
        found.extend(
            re.captures_iter(text)
                .filter_map(|caps| caps.get(1))
                .map(|m| (m.start(), m.as_str())),
        );
    }
    found.sort_by_key(|(offset, _)| *offset);

    let mut seen = BTreeSet::new();
    found
        .into_iter()
        .map(|(_, name)| name)
        .filter(|name| name.len() > 1 && !CODE_KEYWORDS.contains(name))
        .filter(|name| seen.insert(name.to_string()))
        .map(str::to_string)
        .collect()
}

/// CamelCase type names such as `AuthService`.
pub fn type_names(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    identifiers(text)
        .into_iter()
        .filter(|ident| {
            let mut chars = ident.chars();
            ident.len() >= 4
                && chars.next().is_some_and(|c| c.is_ascii_uppercase())
                && ident.chars().any(|c| c.is_ascii_lowercase())
                && ident.chars().skip(1).any(|c| c.is_ascii_uppercase())
        })
        .filter(|ident| seen.insert(ident.to_string()))
        .map(str::to_string)
        .collect()
}

/// Function and type names, the code constructs used for similarity.
pub fn constructs(text: &str) -> BTreeSet<String> {
    function_names(text)
        .into_iter()
        .chain(type_names(text))
        .collect()
}

// ── Keywords and markers ──────────────────────────────────────────────────

/// Lowercased content words of three or more characters.
pub fn keywords(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| w.chars().count() >= 3 && !w.chars().all(|c| c.is_ascii_digit()))
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Error words or exception names, ignoring negated reports such as
/// "0 failed, no errors".
pub fn has_error_marker(text: &str) -> bool {
    let text = strip(&NEGATED_ERROR_RE, text);
    is_match(&ERROR_RE, &text) || is_match(&ERROR_TYPE_RE, &text)
}

pub fn has_fix_marker(text: &str) -> bool {
    is_match(&FIX_RE, text)
}

/// |a ∩ b| / |a ∪ b|, or 0 when both are empty.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

// ── Tools ─────────────────────────────────────────────────────────────────

/// What a tool does, as far as sequencing patterns care.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolAction {
    Read,
    Edit,
    Execute,
    Search,
    Other,
}

pub fn classify_tool(name: &str) -> ToolAction {
    let lower = name.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
    if has(&["search", "grep", "find", "glob", "list"]) {
        ToolAction::Search
    } else if has(&["edit", "write", "patch", "replace", "create", "apply", "insert"]) {
        ToolAction::Edit
    } else if has(&["read", "view", "cat", "open", "show", "get_file"]) {
        ToolAction::Read
    } else if has(&["exec", "run", "shell", "bash", "test", "command", "build"]) {
        ToolAction::Execute
    } else {
        ToolAction::Other
    }
}

/// Score of the `earlier → later` tool pattern, if it is a known one.
pub fn tool_pattern(earlier: ToolAction, later: ToolAction) -> Option<f64> {
    match (earlier, later) {
        (ToolAction::Read, ToolAction::Edit) => Some(1.0),
        (ToolAction::Edit, ToolAction::Execute) => Some(0.8),
        (ToolAction::Search, ToolAction::Read) => Some(0.7),
        _ => None,
    }
}

// ── Code blocks ───────────────────────────────────────────────────────────

/// A piece of message text: prose, or a fenced code block.
#[derive(Debug, Clone, PartialEq)]
pub enum TextPart {
    Prose(String),
    Code {
        language: Option<String>,
        code: String,
    },
}

/// Split `text` on fenced code blocks. An unclosed fence stays prose.
pub fn split_code_blocks(text: &str) -> Vec<TextPart> {
    let mut parts = Vec::new();
    let mut prose: Vec<&str> = Vec::new();
    let mut lines = text.lines().peekable();

    while let Some(line) = lines.next() {
        let Some(info) = line.trim_start().strip_prefix("```") else {
            prose.push(line);
            continue;
        };
        let mut body: Vec<&str> = Vec::new();
        let mut closed = false;
        for inner in lines.by_ref() {
            if inner.trim_start().starts_with("```") {
                closed = true;
                break;
            }
            body.push(inner);
        }
        if !closed {
            prose.push(line);
            prose.extend(body);
            break;
        }
        if !prose.is_empty() {
            parts.push(TextPart::Prose(prose.join("\n")));
            prose.clear();
        }
        let language = info.trim();
        parts.push(TextPart::Code {
            language: (!language.is_empty()).then(|| language.to_string()),
            code: body.join("\n"),
        });
    }
    if !prose.is_empty() {
        parts.push(TextPart::Prose(prose.join("\n")));
    }
    parts
}

/// Up to `n` leading words of `text`, with an ellipsis when cut.
pub fn first_words(text: &str, n: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= n {
        words.join(" ")
    } else {
        format!("{}…", words[..n].join(" "))
    }
}
