//! Symbol demangling
//!
//! Language-hinted demangling of linkage names: `DW_AT_language` picks the
//! demangler when present, mangling-scheme heuristics fill in when it is
//! not. Returns `None` when the input does not demangle; callers fall back
//! to the raw name.

pub fn demangle(name: &str, language: Option<gimli::DwLang>) -> Option<String> {
    match language {
        Some(gimli::DW_LANG_Rust) => demangle_rust(name).or_else(|| demangle_cpp(name)),
        Some(
            gimli::DW_LANG_C_plus_plus
            | gimli::DW_LANG_C_plus_plus_03
            | gimli::DW_LANG_C_plus_plus_11
            | gimli::DW_LANG_C_plus_plus_14,
        ) => demangle_cpp(name).or_else(|| demangle_rust(name)),
        _ => {
            // No usable hint: classify by the mangling scheme itself.
            // Legacy Rust names are valid Itanium manglings too, so Rust
            // goes first.
            if looks_like_rust(name) {
                demangle_rust(name)
            } else if name.starts_with("_Z") {
                demangle_cpp(name)
            } else {
                None
            }
        }
    }
}

/// Rust v0 names start with `_R`; legacy names are Itanium-shaped with a
/// trailing `17h<hash>E` hash segment.
fn looks_like_rust(name: &str) -> bool {
    name.starts_with("_R") || (name.starts_with("_ZN") && name.ends_with('E') && name.contains("17h"))
}

fn demangle_rust(name: &str) -> Option<String> {
    rustc_demangle::try_demangle(name)
        .ok()
        .map(|sym| sym.to_string())
}

fn demangle_cpp(name: &str) -> Option<String> {
    cpp_demangle::Symbol::new(name).ok()?.demangle(&Default::default()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn itanium_names_demangle() {
        let out = demangle("_ZN9wikipedia7article6formatEv", None).unwrap();
        assert!(out.contains("wikipedia::article::format"), "got {out}");
    }

    #[test]
    fn cpp_hint_is_honored() {
        let out = demangle("_Z3addii", Some(gimli::DW_LANG_C_plus_plus)).unwrap();
        assert!(out.contains("add(int, int)"), "got {out}");
    }

    #[test]
    fn legacy_rust_names_route_to_the_rust_demangler() {
        let mangled = "_ZN4core3ptr13drop_in_place17h8f23cfbabc2a5e43E";
        let out = demangle(mangled, None).unwrap();
        assert!(out.starts_with("core::ptr::drop_in_place"), "got {out}");
    }

    #[test]
    fn plain_names_pass_through_as_none() {
        assert_eq!(demangle("main", None), None);
        assert_eq!(demangle("crash_here", Some(gimli::DW_LANG_C)), None);
    }
}
