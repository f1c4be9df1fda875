//! Tool names cross the provider boundary as `server__tool`; providers do not
//! accept `.` in function names.

use super::ToolSpec;

const SEPARATOR: &str = "__";

pub fn to_provider_name(name: &str) -> String {
    name.replace('.', SEPARATOR)
}

pub fn from_provider_name(name: &str) -> String {
    name.replace(SEPARATOR, ".")
}

/// Map a name returned by the model back to the tool it was offered as.
/// Falls back to plain substitution for names that were never offered.
pub fn resolve(provider_name: &str, offered: &[ToolSpec]) -> String {
    offered
        .iter()
        .find(|t| to_provider_name(&t.name) == provider_name)
        .map(|t| t.name.clone())
        .unwrap_or_else(|| from_provider_name(provider_name))
}
