//! Trace persistence round-trips.

mod common;

use std::path::Path;

use common::*;
use retrace::db::Db;
use retrace::flags::SUCCESS;
use retrace::run::invoke;

/// Serialize, load, and serialize again: the bytes must not change, even for
/// a trace with multiple commands and inherited fd tables.
#[test]
fn save_load_save_is_byte_stable() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("child.sh", "writes out\n")?;

    let out_path = space.path("out");
    invoke(
        &space.options(),
        script(move |b, c| {
            let exe = b.trace_path_ref(c, cwd_ref(), Path::new("child.sh"), read_flags())?;
            b.trace_expect_result(c, exe, SUCCESS);
            let child = b.trace_launch(
                c,
                Path::new("child.sh"),
                vec!["child.sh".to_string()],
                stdio_fds(),
                exe,
                cwd_ref(),
                root_ref(),
            );
            let r = b.trace_path_ref(child, cwd_ref(), Path::new("out"), create_flags())?;
            b.trace_expect_result(child, r, SUCCESS);
            std::fs::write(&out_path, "O")?;
            b.trace_update_content(child, r)?;
            b.trace_exit(child, 0)?;
            b.trace_join(c, child, 0);
            Ok(0)
        }),
    )?;

    let original = space.trace_bytes()?;

    let db = Db::open(&space.path(".retrace"))?;
    let (commands, trace) = db.load_trace()?.expect("trace exists");

    let other_dir = tempfile::tempdir()?;
    let other = Db::open(&other_dir.path().join(".retrace"))?;
    other.save_trace(&commands, &trace)?;
    let resaved = std::fs::read(other_dir.path().join(".retrace/trace"))?;
    assert_eq!(original, resaved);
    Ok(())
}

/// An unsupported format version is rejected with a clear error rather than
/// a misparse.
#[test]
fn future_format_version_is_rejected() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"rtrc");
    bytes.extend_from_slice(&7u32.to_le_bytes());
    std::fs::create_dir_all(space.path(".retrace"))?;
    std::fs::write(space.path(".retrace/trace"), &bytes)?;

    let db = Db::open(&space.path(".retrace"))?;
    let err = db.load_trace().unwrap_err();
    assert!(err.to_string().contains("version"), "error: {:#}", err);
    Ok(())
}
