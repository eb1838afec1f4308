use crate::VfsError;

/// Normalize a read path before it is joined onto the file system root.
///
/// - Replaces backslashes with forward slashes
/// - Collapses redundant separators (`a///b` → `a/b`)
/// - Drops `.` segments
/// - Rejects `..` segments (path traversal not allowed)
/// - Strips leading and trailing slashes
///
/// Returns `Err(VfsError::InvalidPath)` if the path is empty or contains `..`.
pub(crate) fn normalize(path: &str) -> Result<String, VfsError> {
    let replaced = path.replace('\\', "/");
    let mut segments = Vec::new();

    for segment in replaced.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        if segment == ".." {
            return Err(VfsError::InvalidPath(
                "path traversal (..) not allowed".into(),
            ));
        }
        segments.push(segment);
    }

    if segments.is_empty() {
        return Err(VfsError::InvalidPath("empty path".into()));
    }

    Ok(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_path() {
        assert_eq!(normalize("shaders/blur.wgsl").unwrap(), "shaders/blur.wgsl");
    }

    #[test]
    fn leading_slash() {
        assert_eq!(normalize("/shaders/blur.wgsl").unwrap(), "shaders/blur.wgsl");
    }

    #[test]
    fn redundant_slashes_and_dots() {
        assert_eq!(
            normalize("shaders//./blur.wgsl").unwrap(),
            "shaders/blur.wgsl"
        );
    }

    #[test]
    fn backslashes() {
        assert_eq!(normalize("shaders\\blur.wgsl").unwrap(), "shaders/blur.wgsl");
    }

    #[test]
    fn reject_dotdot() {
        assert!(normalize("shaders/../secret.wgsl").is_err());
    }

    #[test]
    fn reject_empty() {
        assert!(normalize("").is_err());
        assert!(normalize("///").is_err());
    }
}
