//! Stateless input cleaning.
//!
//! # Responsibilities
//! - HTML: escape, or strip scripts/event handlers/executable URLs
//! - URLs: only http(s) to public hosts survive
//! - Colour values: strip markup and keywords, then enforce a whitelist
//! - File content: size cap, executable signatures, image magic bytes
//!
//! Every function reports whether it changed the input and why.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::{Host, Url};

/// Replacement for any URL that is blocked or malformed.
pub const URL_PLACEHOLDER: &str = "about:blank";

/// Longest colour value kept.
pub const MAX_COLOR_INPUT_LENGTH: usize = 100;

/// Largest file accepted by `validate_file_content`.
pub const MAX_FILE_BYTES: usize = 10 * 1024 * 1024;

static SCRIPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("valid regex"));
static SCRIPT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<\s*/?\s*script\b[^>]*>").expect("valid regex"));
static EVENT_HANDLER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\s+on[a-z]+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).expect("valid regex")
});
static JAVASCRIPT_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)javascript\s*:").expect("valid regex"));
static EXECUTABLE_DATA_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)data\s*:\s*(text/html|text/javascript|application/(x-)?javascript|image/svg\+xml)")
        .expect("valid regex")
});
static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));
static SCRIPT_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(javascript|vbscript|script|expression|eval|alert|prompt|confirm|document|window)\b")
        .expect("valid regex")
});

/// Result of a text sanitizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizeResult {
    pub value: String,
    pub was_modified: bool,
    pub issues: Vec<String>,
}

/// Result of [`sanitize_url`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlSanitizeResult {
    pub value: String,
    pub was_modified: bool,
    pub issues: Vec<String>,
    /// Set when the URL was replaced by the placeholder.
    pub blocked: Option<String>,
}

/// Options for [`sanitize_html`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HtmlOptions {
    pub allow_html: bool,
    pub max_length: usize,
    pub strip_events: bool,
}

impl Default for HtmlOptions {
    fn default() -> Self {
        Self {
            allow_html: false,
            max_length: 10_000,
            strip_events: true,
        }
    }
}

impl HtmlOptions {
    /// Markup allowed, active content stripped.
    pub fn permissive() -> Self {
        Self {
            allow_html: true,
            ..Self::default()
        }
    }
}

fn truncate_chars(input: &str, max: usize) -> Option<String> {
    if input.chars().count() > max {
        Some(input.chars().take(max).collect())
    } else {
        None
    }
}

fn replace_counted(re: &Regex, text: &mut String, with: &str) -> bool {
    if re.is_match(text) {
        *text = re.replace_all(text, with).into_owned();
        true
    } else {
        false
    }
}

/// Escape every HTML metacharacter.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '/' => out.push_str("&#x2F;"),
            _ => out.push(c),
        }
    }
    out
}

/// Clean free text that may or may not be allowed to carry markup.
pub fn sanitize_html(input: &str, options: HtmlOptions) -> SanitizeResult {
    let mut issues = Vec::new();
    let mut value = match truncate_chars(input, options.max_length) {
        Some(truncated) => {
            issues.push(format!("truncated_to_{}_chars", options.max_length));
            truncated
        }
        None => input.to_string(),
    };

    if !options.allow_html {
        let escaped = escape_html(&value);
        if escaped != value {
            issues.push("html_escaped".to_string());
            value = escaped;
        }
    } else {
        let mut scripts = replace_counted(&SCRIPT_BLOCK, &mut value, "");
        scripts |= replace_counted(&SCRIPT_TAG, &mut value, "");
        if scripts {
            issues.push("script_removed".to_string());
        }
        if options.strip_events && replace_counted(&EVENT_HANDLER, &mut value, "") {
            issues.push("event_handlers_removed".to_string());
        }
        if replace_counted(&JAVASCRIPT_URL, &mut value, "blocked:") {
            issues.push("javascript_url_neutralized".to_string());
        }
        if replace_counted(&EXECUTABLE_DATA_URL, &mut value, "blocked:") {
            issues.push("data_url_neutralized".to_string());
        }
    }

    SanitizeResult {
        was_modified: value != input,
        value,
        issues,
    }
}

fn blocked_ipv4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified() || ip.is_broadcast()
}

fn blocked_ipv6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let unique_local = (first & 0xfe00) == 0xfc00;
    let link_local = (first & 0xffc0) == 0xfe80;
    ip.is_loopback()
        || ip.is_unspecified()
        || unique_local
        || link_local
        || ip.to_ipv4_mapped().is_some_and(blocked_ipv4)
}

fn blocked_domain(domain: &str) -> bool {
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    domain == "localhost"
        || domain.ends_with(".localhost")
        || domain.ends_with(".local")
        || domain.ends_with(".internal")
        || domain.ends_with(".onion")
}

/// Keep only http(s) URLs pointing at public hosts.
pub fn sanitize_url(input: &str) -> UrlSanitizeResult {
    let trimmed = input.trim();
    let blocked = |reason: String| UrlSanitizeResult {
        value: URL_PLACEHOLDER.to_string(),
        was_modified: true,
        issues: vec![reason.clone()],
        blocked: Some(reason),
    };

    let parsed = match Url::parse(trimmed) {
        Ok(url) => url,
        Err(e) => return blocked(format!("malformed_url: {}", e)),
    };

    match parsed.scheme() {
        "http" | "https" => {}
        other => return blocked(format!("blocked_scheme: {}", other)),
    }

    let host_blocked = match parsed.host() {
        None => return blocked("missing_host".to_string()),
        Some(Host::Domain(domain)) => blocked_domain(domain),
        Some(Host::Ipv4(ip)) => blocked_ipv4(ip),
        Some(Host::Ipv6(ip)) => blocked_ipv6(ip),
    };
    if host_blocked {
        return blocked(format!(
            "blocked_host: {}",
            parsed.host_str().unwrap_or_default()
        ));
    }

    let mut issues = Vec::new();
    if !parsed.username().is_empty() || parsed.password().is_some() {
        issues.push("credentials_present".to_string());
    }

    let value = parsed.to_string();
    UrlSanitizeResult {
        was_modified: value != input,
        value,
        issues,
        blocked: None,
    }
}

/// Reduce a colour value to the safe character set.
pub fn sanitize_color_input(input: &str) -> SanitizeResult {
    let mut issues = Vec::new();
    let mut value = input.to_string();

    if replace_counted(&SCRIPT_BLOCK, &mut value, "") {
        issues.push("script_removed".to_string());
    }
    if replace_counted(&ANY_TAG, &mut value, "") {
        issues.push("html_tags_removed".to_string());
    }
    if replace_counted(&SCRIPT_KEYWORDS, &mut value, "") {
        issues.push("script_keywords_removed".to_string());
    }
    if let Some(truncated) = truncate_chars(&value, MAX_COLOR_INPUT_LENGTH) {
        issues.push(format!("truncated_to_{}_chars", MAX_COLOR_INPUT_LENGTH));
        value = truncated;
    }

    let filtered: String = value.chars().filter(|c| is_color_char(*c)).collect();
    if filtered != value {
        issues.push("disallowed_characters_removed".to_string());
    }
    let value = filtered.trim().to_string();

    SanitizeResult {
        was_modified: value != input,
        value,
        issues,
    }
}

/// Characters permitted in colour values: hex, functional notation, names.
pub fn is_color_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '#' | '(' | ')' | ',' | '.' | '%' | '-' | ' ' | '\t')
}

/// Expected kind of an uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Image,
    Text,
    Binary,
}

/// Result of [`validate_file_content`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileValidation {
    pub valid: bool,
    pub detected_format: Option<String>,
    pub issues: Vec<String>,
}

const IMAGE_SIGNATURES: &[(&str, &[u8])] = &[
    ("png", &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]),
    ("jpeg", &[0xFF, 0xD8, 0xFF]),
    ("gif", b"GIF87a"),
    ("gif", b"GIF89a"),
    ("bmp", b"BM"),
    ("tiff", &[b'I', b'I', 0x2A, 0x00]),
    ("tiff", &[b'M', b'M', 0x00, 0x2A]),
    ("ico", &[0x00, 0x00, 0x01, 0x00]),
];

const EXECUTABLE_SIGNATURES: &[(&str, &[u8])] = &[
    ("pe", b"MZ"),
    ("elf", &[0x7F, b'E', b'L', b'F']),
    ("mach-o", &[0xFE, 0xED, 0xFA, 0xCE]),
    ("mach-o", &[0xFE, 0xED, 0xFA, 0xCF]),
    ("mach-o", &[0xCE, 0xFA, 0xED, 0xFE]),
    ("mach-o", &[0xCF, 0xFA, 0xED, 0xFE]),
    ("java-class", &[0xCA, 0xFE, 0xBA, 0xBE]),
    ("shebang", b"#!"),
];

const SCRIPT_PREFIXES: &[&str] = &["<script", "<?php", "<%", "<html", "<svg"];

fn detect_image(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("webp");
    }
    IMAGE_SIGNATURES
        .iter()
        .find(|(_, sig)| bytes.starts_with(sig))
        .map(|(name, _)| *name)
}

fn detect_executable(bytes: &[u8]) -> Option<&'static str> {
    if let Some((name, _)) = EXECUTABLE_SIGNATURES
        .iter()
        .find(|(_, sig)| bytes.starts_with(sig))
    {
        return Some(name);
    }
    let head = &bytes[..bytes.len().min(64)];
    let head = String::from_utf8_lossy(head).trim_start().to_ascii_lowercase();
    SCRIPT_PREFIXES
        .iter()
        .any(|prefix| head.starts_with(prefix))
        .then_some("script")
}

/// Check an uploaded buffer against size, executable and format rules.
pub fn validate_file_content(bytes: &[u8], kind: FileKind) -> FileValidation {
    let mut issues = Vec::new();

    if bytes.is_empty() {
        issues.push("empty_file".to_string());
    }
    if bytes.len() > MAX_FILE_BYTES {
        issues.push(format!("file_too_large: {} > {} bytes", bytes.len(), MAX_FILE_BYTES));
    }
    if let Some(name) = detect_executable(bytes) {
        issues.push(format!("executable_content: {}", name));
    }

    let detected_format = match kind {
        FileKind::Image => {
            let detected = detect_image(bytes);
            if detected.is_none() && !bytes.is_empty() {
                issues.push("unrecognized_image_format".to_string());
            }
            detected.map(str::to_string)
        }
        FileKind::Text => {
            if std::str::from_utf8(bytes).is_err() {
                issues.push("invalid_utf8".to_string());
            }
            Some("text".to_string())
        }
        FileKind::Binary => None,
    };

    FileValidation {
        valid: issues.is_empty(),
        detected_format,
        issues,
    }
}
