//! Backend shader compiler interface and the WGSL implementation.
//!
//! The compiler is synchronous from its own point of view: it receives
//! the accumulated source, resolves includes through `on_include`, and
//! reports the outcome through `on_finished`. The shader database runs it
//! inside a task and supplies both callbacks — `on_include` bridges to
//! the asynchronous file system, `on_finished` publishes completion flags
//! under the shader table's write lock.

use super::preprocess;

/// Description of one shader compile request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderDesc {
    /// Display name, used in diagnostics.
    pub name: String,
    /// Entry point that must exist in the compiled module.
    pub entry_point: String,
    /// Source path, resolved by the file system.
    pub path: String,
}

impl ShaderDesc {
    pub fn new(
        name: impl Into<String>,
        entry_point: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            entry_point: entry_point.into(),
            path: path.into(),
        }
    }
}

/// A successfully compiled shader artifact.
pub struct CompiledShader {
    /// The validated module, ready for backend lowering.
    pub module: naga::Module,
}

impl std::fmt::Debug for CompiledShader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledShader")
            .field("entry_points", &self.module.entry_points.len())
            .finish()
    }
}

/// Outcome of one compile, delivered through `on_finished`.
pub struct CompileResult {
    pub success: bool,
    pub diagnostic: Option<String>,
    pub artifact: Option<CompiledShader>,
}

impl CompileResult {
    pub(crate) fn failure(diagnostic: impl Into<String>) -> Self {
        Self {
            success: false,
            diagnostic: Some(diagnostic.into()),
            artifact: None,
        }
    }

    pub(crate) fn finished(artifact: CompiledShader) -> Self {
        Self {
            success: true,
            diagnostic: None,
            artifact: Some(artifact),
        }
    }
}

/// Resolves an include path to file bytes, or an error description.
pub type IncludeFn<'a> = dyn FnMut(&str) -> Result<Vec<u8>, String> + 'a;

/// Receives the compile outcome exactly once.
pub type FinishedFn<'a> = dyn FnMut(CompileResult) + 'a;

/// Backend shader compiler.
pub trait ShaderCompiler: Send + Sync + 'static {
    /// Compile `source`, resolving includes through `on_include` and
    /// reporting the outcome through `on_finished`.
    ///
    /// Must call `on_finished` exactly once and must not panic on bad
    /// input — compile failures are data, not errors.
    fn compile(
        &self,
        name: &str,
        entry_point: &str,
        source: &str,
        on_include: &mut IncludeFn<'_>,
        on_finished: &mut FinishedFn<'_>,
    );
}

/// WGSL compiler: include expansion, naga parse, validation, entry-point
/// lookup.
#[derive(Debug, Default)]
pub struct WgslCompiler;

impl WgslCompiler {
    pub fn new() -> Self {
        Self
    }
}

impl ShaderCompiler for WgslCompiler {
    fn compile(
        &self,
        name: &str,
        entry_point: &str,
        source: &str,
        on_include: &mut IncludeFn<'_>,
        on_finished: &mut FinishedFn<'_>,
    ) {
        let expanded = match preprocess::expand_includes(source, on_include) {
            Ok(expanded) => expanded,
            Err(diagnostic) => {
                on_finished(CompileResult::failure(diagnostic));
                return;
            }
        };

        let module = match naga::front::wgsl::parse_str(&expanded) {
            Ok(module) => module,
            Err(err) => {
                on_finished(CompileResult::failure(err.emit_to_string(&expanded)));
                return;
            }
        };

        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        );
        if let Err(err) = validator.validate(&module) {
            on_finished(CompileResult::failure(format!(
                "validation of '{name}' failed: {err:?}"
            )));
            return;
        }

        if !entry_point.is_empty() && !module.entry_points.iter().any(|ep| ep.name == entry_point) {
            on_finished(CompileResult::failure(format!(
                "entry point '{entry_point}' not found in '{name}'"
            )));
            return;
        }

        on_finished(CompileResult::finished(CompiledShader { module }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(source: &str, entry_point: &str, files: &[(&str, &str)]) -> CompileResult {
        let compiler = WgslCompiler::new();
        let mut result = None;
        let mut on_include = |path: &str| {
            files
                .iter()
                .find(|(name, _)| *name == path)
                .map(|(_, contents)| contents.as_bytes().to_vec())
                .ok_or_else(|| format!("no such file: {path}"))
        };
        compiler.compile(
            "test",
            entry_point,
            source,
            &mut on_include,
            &mut |r| result = Some(r),
        );
        result.expect("compiler did not report a result")
    }

    const TRIVIAL: &str = "@compute @workgroup_size(1) fn main() { }\n";

    #[test]
    fn trivial_compute_shader_compiles() {
        let result = compile(TRIVIAL, "main", &[]);
        assert!(result.success);
        assert!(result.diagnostic.is_none());
        let artifact = result.artifact.unwrap();
        assert_eq!(artifact.module.entry_points.len(), 1);
    }

    #[test]
    fn syntax_error_reports_diagnostic() {
        let result = compile("this is not wgsl", "main", &[]);
        assert!(!result.success);
        assert!(result.diagnostic.is_some());
        assert!(result.artifact.is_none());
    }

    #[test]
    fn missing_entry_point_fails() {
        let result = compile(TRIVIAL, "not_main", &[]);
        assert!(!result.success);
        assert!(result.diagnostic.unwrap().contains("not_main"));
    }

    #[test]
    fn empty_entry_point_skips_lookup() {
        let result = compile(TRIVIAL, "", &[]);
        assert!(result.success);
    }

    #[test]
    fn include_participates_in_compilation() {
        let source = "#include \"lib.wgsl\"\n@compute @workgroup_size(1) fn main() { let x = K; }\n";
        let result = compile(source, "main", &[("lib.wgsl", "const K: f32 = 2.0;")]);
        assert!(result.success, "diagnostic: {:?}", result.diagnostic);
    }

    #[test]
    fn missing_include_fails_compile() {
        let source = "#include \"nope.wgsl\"\nfn main() { }\n";
        let result = compile(source, "", &[]);
        assert!(!result.success);
        assert!(result.diagnostic.unwrap().contains("nope.wgsl"));
    }
}
