//! Module name safety predicate.
//!
//! The same check guards directories found during discovery and the
//! top-level directory of an uploaded archive.

use std::sync::LazyLock;

use regex::Regex;

/// Maximum length of a module name, matching common filename limits.
pub const MAX_NAME_LEN: usize = 255;

/// Names kept for the host and its build and scratch directories.
/// Compared case-insensitively.
pub const RESERVED_NAMES: &[&str] = &["core", "kernel", "modhub", "modules", "target", "tmp"];

#[allow(clippy::expect_used)]
static MODULE_NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("module name pattern compiles")
});

/// Check whether `name` is a safe module identifier.
pub fn is_valid_module_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    if !MODULE_NAME_PATTERN.is_match(name) {
        return false;
    }
    let lower = name.to_ascii_lowercase();
    !RESERVED_NAMES.contains(&lower.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_identifiers() {
        for name in ["crm", "Sales", "hr_base", "a1", "x"] {
            assert!(is_valid_module_name(name), "{name} should be valid");
        }
    }

    #[test]
    fn rejects_unsafe_names() {
        for name in [
            "",
            "_private",
            "1crm",
            "crm-sales",
            "../crm",
            "crm/sales",
            "crm.backup",
            "__init__",
            "with space",
            "Target",
            "KERNEL",
        ] {
            assert!(!is_valid_module_name(name), "{name:?} should be rejected");
        }
    }

    #[test]
    fn rejects_overlong_names() {
        let name = "a".repeat(MAX_NAME_LEN + 1);
        assert!(!is_valid_module_name(&name));
        assert!(is_valid_module_name(&"a".repeat(MAX_NAME_LEN)));
    }
}
