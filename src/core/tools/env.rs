//! Environment filtering for spawned tool servers. Credentials held by the
//! daemon must never reach a tool subprocess.

use std::collections::HashMap;

const BLOCKED_EXACT: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "GOOGLE_API_KEY",
    "GEMINI_API_KEY",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "NPM_TOKEN",
    "DATABASE_URL",
];

const BLOCKED_SUFFIXES: &[&str] = &[
    "_TOKEN",
    "_SECRET",
    "_PASSWORD",
    "_API_KEY",
    "_APIKEY",
    "_PRIVATE_KEY",
    "_ACCESS_KEY",
    "_CREDENTIALS",
];

pub fn is_blocked(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    BLOCKED_EXACT.contains(&upper.as_str())
        || BLOCKED_SUFFIXES.iter().any(|s| upper.ends_with(s))
}

pub fn filtered_env<I, K, V>(vars: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    vars.into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .filter(|(k, _)| !is_blocked(k))
        .collect()
}

/// The daemon's own environment with blocked variables removed.
pub fn inherited_env() -> HashMap<String, String> {
    filtered_env(std::env::vars())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_exact_names_and_suffixes() {
        assert!(is_blocked("ANTHROPIC_API_KEY"));
        assert!(is_blocked("GH_TOKEN"));
        assert!(is_blocked("slack_bot_token"));
        assert!(is_blocked("Db_Password"));
        assert!(is_blocked("STRIPE_SECRET"));
        assert!(!is_blocked("PATH"));
        assert!(!is_blocked("HOME"));
        assert!(!is_blocked("TOKENIZER_PATH"));
    }

    #[test]
    fn filtered_env_drops_blocked_entries() {
        let env = filtered_env([
            ("PATH", "/usr/bin"),
            ("OPENAI_API_KEY", "sk-1"),
            ("MY_SERVICE_APIKEY", "x"),
            ("LANG", "C.UTF-8"),
        ]);
        let mut keys: Vec<_> = env.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["LANG", "PATH"]);
    }
}
