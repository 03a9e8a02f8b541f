//! Shell escaping and quoting utilities.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

/// `NAME=value` assignments whose name looks like a credential, with a bare
/// or single-quoted value.
static SECRET_ASSIGNMENT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([A-Z0-9_]*(?:PASS|SECRET|TOKEN)[A-Z0-9_]*)=(?:'[^'\s][^']*'|\\'|[^\s'])*").ok()
});

const MASK: &str = "******";

fn is_secret_name(name: &str) -> bool {
    let name = name.to_ascii_uppercase();
    ["PASS", "SECRET", "TOKEN"].iter().any(|word| name.contains(word))
}

/// Escape a value for use inside single quotes.
/// Replaces `'` with `'\''` (end quote, escaped quote, start quote).
pub fn escape_single_quote_content(value: &str) -> String {
    value.replace('\'', "'\\''")
}

/// Quote a single argument for shell execution.
/// - Empty strings become `''`
/// - Strings with shell metacharacters are wrapped in single quotes
/// - Embedded single quotes are escaped
pub fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }

    // Characters that require quoting
    const SHELL_META: &[char] = &[
        ' ', '\t', '\n', '\'', '"', '\\', '$', '`', '!', '*', '?', '[', ']', '(', ')', '{', '}',
        '<', '>', '|', '&', ';', '#', '~',
    ];

    if !arg.contains(SHELL_META) {
        return arg.to_string();
    }

    format!("'{}'", escape_single_quote_content(arg))
}

/// Quote and join multiple arguments for shell execution.
pub fn quote_args(args: &[String]) -> String {
    args.iter()
        .map(|a| quote_arg(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quote a path (or any single word) for shell execution. Always quotes.
pub fn quote_path(path: &str) -> String {
    format!("'{}'", escape_single_quote_content(path))
}

/// Mask credential values in a shell line before it is logged or reported.
pub fn redact_secrets(command: &str) -> Cow<'_, str> {
    match SECRET_ASSIGNMENT.as_ref() {
        Some(pattern) => pattern.replace_all(command, format!("${{1}}={}", MASK)),
        None => Cow::Owned(MASK.to_string()),
    }
}

/// Mask the credential entries of `assignments` wherever they occur in
/// `text`, as given or escaped for one more level of single quotes, then
/// any other credential-looking assignment.
pub fn redact_assignments(text: &str, assignments: &[String]) -> String {
    let mut text = text.to_string();
    for assignment in assignments {
        let Some((name, value)) = assignment.split_once('=') else {
            continue;
        };
        if value.is_empty() || !is_secret_name(name) {
            continue;
        }
        let masked = format!("{}={}", name, MASK);
        text = text
            .replace(&escape_single_quote_content(assignment), &masked)
            .replace(assignment.as_str(), &masked);
    }
    redact_secrets(&text).into_owned()
}
