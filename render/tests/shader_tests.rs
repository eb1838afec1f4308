//! Shader database integration tests.
//!
//! Drive the asynchronous compile pipeline end to end: streaming source
//! reads, include resolution bridged synchronously from a worker task,
//! result publication, and resolve/release teardown.

mod common;

use common::{TRIVIAL_SHADER, TestContext};
use ember_render::ShaderDesc;

#[test]
fn compile_succeeds_and_is_stable_after_resolve() {
    let ctx = TestContext::new("shader_ok");
    ctx.write_shader("ok.wgsl", TRIVIAL_SHADER);

    let shader = ctx
        .db
        .request_compile(ShaderDesc::new("ok", "main", "ok.wgsl"));
    ctx.db.resolve(shader);

    assert!(ctx.db.is_valid(shader));
    assert!(ctx.db.compile_error(shader).is_none());
    // Stable: repeated queries and resolves never flip the outcome.
    ctx.db.resolve(shader);
    assert!(ctx.db.is_valid(shader));
    assert!(ctx.db.is_valid(shader));

    ctx.db.release(shader);
    assert!(!ctx.db.is_valid(shader));
    assert_eq!(ctx.db.shader_count(), 0);
}

#[test]
fn failed_source_read_resolves_invalid() {
    let ctx = TestContext::new("shader_missing_file");

    let shader = ctx
        .db
        .request_compile(ShaderDesc::new("ghost", "main", "does_not_exist.wgsl"));
    ctx.db.resolve(shader);

    assert!(!ctx.db.is_valid(shader));
    assert!(ctx.db.is_ready(shader));
    let diagnostic = ctx.db.compile_error(shader).unwrap();
    assert!(diagnostic.contains("read failed"), "got: {diagnostic}");

    ctx.db.release(shader);
}

#[test]
fn syntax_error_reports_compile_diagnostic() {
    let ctx = TestContext::new("shader_syntax");
    ctx.write_shader("bad.wgsl", "definitely not wgsl ((((");

    let shader = ctx
        .db
        .request_compile(ShaderDesc::new("bad", "main", "bad.wgsl"));
    ctx.db.resolve(shader);

    assert!(!ctx.db.is_valid(shader));
    assert!(ctx.db.compile_error(shader).is_some());

    ctx.db.release(shader);
}

#[test]
fn missing_entry_point_fails() {
    let ctx = TestContext::new("shader_entry");
    ctx.write_shader("entry.wgsl", TRIVIAL_SHADER);

    let shader = ctx
        .db
        .request_compile(ShaderDesc::new("entry", "not_there", "entry.wgsl"));
    ctx.db.resolve(shader);

    assert!(!ctx.db.is_valid(shader));
    assert!(
        ctx.db
            .compile_error(shader)
            .unwrap()
            .contains("not_there")
    );

    ctx.db.release(shader);
}

#[test]
fn include_is_resolved_from_worker_task() {
    let ctx = TestContext::new("shader_include");
    ctx.write_shader("lib/consts.wgsl", "const SCALE: f32 = 4.0;\n");
    ctx.write_shader(
        "scaled.wgsl",
        "#include \"lib/consts.wgsl\"\n@compute @workgroup_size(1) fn main() { let x = SCALE; }\n",
    );

    let shader = ctx
        .db
        .request_compile(ShaderDesc::new("scaled", "main", "scaled.wgsl"));
    ctx.db.resolve(shader);

    assert!(
        ctx.db.is_valid(shader),
        "diagnostic: {:?}",
        ctx.db.compile_error(shader)
    );

    ctx.db.release(shader);
}

#[test]
fn nested_includes_compile() {
    let ctx = TestContext::new("shader_nested_include");
    ctx.write_shader("a.wgsl", "#include \"b.wgsl\"\nconst A: f32 = B + 1.0;\n");
    ctx.write_shader("b.wgsl", "const B: f32 = 1.0;\n");
    ctx.write_shader(
        "main.wgsl",
        "#include \"a.wgsl\"\n@compute @workgroup_size(1) fn main() { let x = A; }\n",
    );

    let shader = ctx
        .db
        .request_compile(ShaderDesc::new("nested", "main", "main.wgsl"));
    ctx.db.resolve(shader);

    assert!(
        ctx.db.is_valid(shader),
        "diagnostic: {:?}",
        ctx.db.compile_error(shader)
    );

    ctx.db.release(shader);
}

#[test]
fn missing_include_fails_with_path_in_diagnostic() {
    let ctx = TestContext::new("shader_missing_include");
    ctx.write_shader(
        "broken.wgsl",
        "#include \"nowhere.wgsl\"\n@compute @workgroup_size(1) fn main() { }\n",
    );

    let shader = ctx
        .db
        .request_compile(ShaderDesc::new("broken", "main", "broken.wgsl"));
    ctx.db.resolve(shader);

    assert!(!ctx.db.is_valid(shader));
    let diagnostic = ctx.db.compile_error(shader).unwrap();
    assert!(diagnostic.contains("nowhere.wgsl"), "got: {diagnostic}");

    ctx.db.release(shader);
}

#[test]
fn concurrent_compiles_terminate_independently() {
    let ctx = TestContext::new("shader_concurrent");

    // A mix of successes and failures, requested before any resolve.
    let count = 8;
    let mut expected = Vec::new();
    let mut handles = Vec::new();
    for i in 0..count {
        let ok = i % 3 != 0;
        let path = format!("s{i}.wgsl");
        if ok {
            ctx.write_shader(&path, TRIVIAL_SHADER);
        } else {
            ctx.write_shader(&path, "broken (");
        }
        expected.push(ok);
        handles.push(
            ctx.db
                .request_compile(ShaderDesc::new(format!("s{i}"), "main", path)),
        );
    }

    // Resolve in reverse order to decorrelate from completion order.
    for &handle in handles.iter().rev() {
        ctx.db.resolve(handle);
    }

    for (handle, ok) in handles.iter().zip(&expected) {
        assert!(ctx.db.is_ready(*handle));
        assert_eq!(ctx.db.is_valid(*handle), *ok);
    }

    for handle in handles {
        ctx.db.release(handle);
    }
    assert_eq!(ctx.db.shader_count(), 0);
}

#[test]
fn stale_shader_handle_queries_are_false() {
    let ctx = TestContext::new("shader_stale");
    ctx.write_shader("s.wgsl", TRIVIAL_SHADER);

    let shader = ctx.db.request_compile(ShaderDesc::new("s", "main", "s.wgsl"));
    ctx.db.release(shader);

    assert!(!ctx.db.is_valid(shader));
    assert!(!ctx.db.is_ready(shader));
    assert!(ctx.db.compile_error(shader).is_none());
    // Resolving a stale handle is a no-op, not a crash.
    ctx.db.resolve(shader);
}
