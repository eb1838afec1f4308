//! `#include` expansion for shader sources.
//!
//! The compiler sees a single stitched source string; includes are
//! resolved through a caller-supplied callback so the database can bridge
//! them to the asynchronous file system. Nested includes are expanded
//! recursively with a cycle guard and a depth limit.

const MAX_INCLUDE_DEPTH: usize = 32;

/// Expand every `#include "path"` directive in `source`.
///
/// `resolve` returns the raw bytes of an included file or an error
/// description. Errors come back as diagnostics, never panics.
pub(crate) fn expand_includes(
    source: &str,
    resolve: &mut dyn FnMut(&str) -> Result<Vec<u8>, String>,
) -> Result<String, String> {
    let mut active = Vec::new();
    expand_into(source, resolve, &mut active)
}

fn expand_into(
    source: &str,
    resolve: &mut dyn FnMut(&str) -> Result<Vec<u8>, String>,
    active: &mut Vec<String>,
) -> Result<String, String> {
    if active.len() > MAX_INCLUDE_DEPTH {
        return Err(format!(
            "include depth limit ({MAX_INCLUDE_DEPTH}) exceeded"
        ));
    }

    let mut out = String::with_capacity(source.len());
    for line in source.lines() {
        match parse_include(line)? {
            Some(path) => {
                if active.iter().any(|p| p == path) {
                    return Err(format!("cyclic include of '{path}'"));
                }
                let bytes =
                    resolve(path).map_err(|err| format!("failed to include '{path}': {err}"))?;
                let text = String::from_utf8(bytes)
                    .map_err(|_| format!("include '{path}' is not valid UTF-8"))?;
                active.push(path.to_string());
                let expanded = expand_into(&text, resolve, active)?;
                active.pop();
                out.push_str(&expanded);
            }
            None => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    Ok(out)
}

fn parse_include(line: &str) -> Result<Option<&str>, String> {
    let trimmed = line.trim();
    let Some(rest) = trimmed.strip_prefix("#include") else {
        return Ok(None);
    };
    let rest = rest.trim();
    rest.strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .map(Some)
        .ok_or_else(|| format!("malformed #include directive: {trimmed}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolver(files: &[(&str, &str)]) -> impl FnMut(&str) -> Result<Vec<u8>, String> {
        let map: HashMap<String, Vec<u8>> = files
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect();
        move |path: &str| {
            map.get(path)
                .cloned()
                .ok_or_else(|| format!("no such file: {path}"))
        }
    }

    #[test]
    fn passthrough_without_includes() {
        let mut resolve = resolver(&[]);
        let out = expand_includes("fn main() {}\n", &mut resolve).unwrap();
        assert_eq!(out, "fn main() {}\n");
    }

    #[test]
    fn expands_single_include() {
        let mut resolve = resolver(&[("lib.wgsl", "const K: f32 = 2.0;")]);
        let out = expand_includes("#include \"lib.wgsl\"\nfn main() {}\n", &mut resolve).unwrap();
        assert!(out.contains("const K: f32 = 2.0;"));
        assert!(out.contains("fn main() {}"));
        assert!(!out.contains("#include"));
    }

    #[test]
    fn expands_nested_includes() {
        let mut resolve = resolver(&[
            ("a.wgsl", "#include \"b.wgsl\"\nconst A: u32 = 1u;"),
            ("b.wgsl", "const B: u32 = 2u;"),
        ]);
        let out = expand_includes("#include \"a.wgsl\"\n", &mut resolve).unwrap();
        let b_pos = out.find("const B").unwrap();
        let a_pos = out.find("const A").unwrap();
        assert!(b_pos < a_pos);
    }

    #[test]
    fn missing_include_is_a_diagnostic() {
        let mut resolve = resolver(&[]);
        let err = expand_includes("#include \"nope.wgsl\"\n", &mut resolve).unwrap_err();
        assert!(err.contains("nope.wgsl"));
    }

    #[test]
    fn cyclic_include_is_detected() {
        let mut resolve = resolver(&[
            ("a.wgsl", "#include \"b.wgsl\""),
            ("b.wgsl", "#include \"a.wgsl\""),
        ]);
        let err = expand_includes("#include \"a.wgsl\"\n", &mut resolve).unwrap_err();
        assert!(err.contains("cyclic"));
    }

    #[test]
    fn malformed_directive_is_rejected() {
        let mut resolve = resolver(&[]);
        let err = expand_includes("#include lib.wgsl\n", &mut resolve).unwrap_err();
        assert!(err.contains("malformed"));
    }

    #[test]
    fn self_include_is_cyclic() {
        let mut resolve = resolver(&[("a.wgsl", "#include \"a.wgsl\"")]);
        let err = expand_includes("#include \"a.wgsl\"\n", &mut resolve).unwrap_err();
        assert!(err.contains("cyclic"));
    }
}
