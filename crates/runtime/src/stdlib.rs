//! Standard-library modules embedded at build time.
//!
//! The runtime is self-contained: `core` (the class bootstrap) and `sys`
//! ship inside the binary and are found before any filesystem search.

use std::collections::HashMap;
use std::sync::LazyLock;

static STDLIB: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    let mut m = HashMap::new();
    m.insert("core", include_str!("../stdlib/core.brio"));
    m.insert("sys", include_str!("../stdlib/sys.brio"));
    m
});

/// Get an embedded module's source by dotted name.
pub fn builtin_source(name: &str) -> Option<&'static str> {
    STDLIB.get(name).copied()
}

/// Whether a module ships embedded in the runtime.
pub fn has_builtin(name: &str) -> bool {
    STDLIB.contains_key(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_is_embedded() {
        assert!(has_builtin("core"));
        let src = builtin_source("core").unwrap();
        assert!(src.contains("class Exception"));
        assert!(src.contains("native print"));
    }

    #[test]
    fn test_sys_is_embedded() {
        assert!(has_builtin("sys"));
        assert!(builtin_source("sys").unwrap().contains("argv"));
    }

    #[test]
    fn test_unknown_module() {
        assert!(!has_builtin("nonexistent"));
        assert!(builtin_source("nonexistent").is_none());
    }
}
