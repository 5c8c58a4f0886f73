//! End-to-end rebuild scenarios, driven through a scripted tracer.

mod common;

use std::path::Path;

use common::*;
use retrace::flags::SUCCESS;
use retrace::plan::RerunReason;
use retrace::run::invoke;

/// Scenario A: a command writes `out`; nothing changes between runs; the
/// second run plans zero commands and leaves `out` alone. Also asserts the
/// round-trip property: the second run's trace is byte-identical.
#[test]
fn unchanged_build_is_idempotent() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let out_path = space.path("out");

    let report = invoke(
        &space.options(),
        script(move |b, c| {
            let r = b.trace_path_ref(c, cwd_ref(), Path::new("out"), create_flags())?;
            b.trace_expect_result(c, r, SUCCESS);
            std::fs::write(&out_path, "hi")?;
            b.trace_update_content(c, r)?;
            Ok(0)
        }),
    )?;
    assert!(report.stats.traced_commands >= 1);
    assert_eq!(space.read("out")?, b"hi");
    let first_trace = space.trace_bytes()?;

    let report = invoke(&space.options(), no_reruns())?;
    assert!(report.planned.is_empty(), "planned: {:?}", report.planned);
    assert_eq!(report.stats.traced_commands, 0);
    assert_eq!(space.read("out")?, b"hi");
    assert_eq!(space.trace_bytes()?, first_trace);
    Ok(())
}

/// A touch that changes mtime but not content is not a change.
#[test]
fn touch_does_not_trigger_a_rebuild() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let out_path = space.path("out");

    invoke(
        &space.options(),
        script(move |b, c| {
            let r = b.trace_path_ref(c, cwd_ref(), Path::new("out"), create_flags())?;
            b.trace_expect_result(c, r, SUCCESS);
            std::fs::write(&out_path, "hi")?;
            b.trace_update_content(c, r)?;
            Ok(0)
        }),
    )?;

    // Rewrite identical content; only the mtime moves.
    space.write("out", "hi")?;
    let report = invoke(&space.options(), no_reruns())?;
    assert!(report.planned.is_empty(), "planned: {:?}", report.planned);
    Ok(())
}

/// Scenario B: the user edits the output between runs; the producer is
/// marked Changed and re-executed, and the build converges again.
#[test]
fn edited_output_reruns_the_producer() -> anyhow::Result<()> {
    let space = TestSpace::new()?;

    let out_path = space.path("out");
    invoke(
        &space.options(),
        script(move |b, c| {
            let r = b.trace_path_ref(c, cwd_ref(), Path::new("out"), create_flags())?;
            b.trace_expect_result(c, r, SUCCESS);
            std::fs::write(&out_path, "hi")?;
            b.trace_update_content(c, r)?;
            Ok(0)
        }),
    )?;

    space.write("out", "hi!")?;

    let out_path = space.path("out");
    let report = invoke(
        &space.options(),
        script(move |b, c| {
            let r = b.trace_path_ref(c, cwd_ref(), Path::new("out"), create_flags())?;
            b.trace_expect_result(c, r, SUCCESS);
            std::fs::write(&out_path, "hi")?;
            b.trace_update_content(c, r)?;
            Ok(0)
        }),
    )?;
    assert_eq!(report.planned.len(), 1);
    assert_eq!(report.planned[0].1, RerunReason::Changed);
    assert_eq!(space.read("out")?, b"hi");

    // With the output regenerated, a third run has nothing to do.
    let report = invoke(&space.options(), no_reruns())?;
    assert!(report.planned.is_empty(), "planned: {:?}", report.planned);
    Ok(())
}

/// Scenario C: A writes tmp, B reads tmp and writes final; the user deletes
/// final. B is Changed, and A re-runs because its output is needed.
#[test]
fn deleted_output_pulls_in_the_producer_chain() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.sh", "writes tmp\n")?;
    space.write("b.sh", "reads tmp, writes final\n")?;

    let run_children = |space: &TestSpace| {
        let tmp = space.path("tmp");
        let fin = space.path("final");
        script(move |b, c| match exe_name(b, c).as_str() {
            "a.sh" => {
                let r = b.trace_path_ref(c, cwd_ref(), Path::new("tmp"), create_flags())?;
                b.trace_expect_result(c, r, SUCCESS);
                std::fs::write(&tmp, "T")?;
                b.trace_update_content(c, r)?;
                Ok(0)
            }
            "b.sh" => {
                let tmp_ref = b.trace_path_ref(c, cwd_ref(), Path::new("tmp"), read_flags())?;
                b.trace_expect_result(c, tmp_ref, SUCCESS);
                b.trace_match_content(c, tmp_ref)?;
                let fin_ref =
                    b.trace_path_ref(c, cwd_ref(), Path::new("final"), create_flags())?;
                b.trace_expect_result(c, fin_ref, SUCCESS);
                std::fs::write(&fin, "F")?;
                b.trace_update_content(c, fin_ref)?;
                Ok(0)
            }
            // The root build file: launch a.sh, then b.sh.
            _ => {
                for name in ["a.sh", "b.sh"] {
                    let exe = b.trace_path_ref(c, cwd_ref(), Path::new(name), read_flags())?;
                    b.trace_expect_result(c, exe, SUCCESS);
                    let child = b.trace_launch(
                        c,
                        Path::new(name),
                        vec![name.to_string()],
                        stdio_fds(),
                        exe,
                        cwd_ref(),
                        root_ref(),
                    );
                    // The scripted supervisor runs the child inline.
                    let status = match name {
                        "a.sh" => {
                            let r = b.trace_path_ref(
                                child,
                                cwd_ref(),
                                Path::new("tmp"),
                                create_flags(),
                            )?;
                            b.trace_expect_result(child, r, SUCCESS);
                            std::fs::write(&tmp, "T")?;
                            b.trace_update_content(child, r)?;
                            0
                        }
                        _ => {
                            let tmp_ref = b.trace_path_ref(
                                child,
                                cwd_ref(),
                                Path::new("tmp"),
                                read_flags(),
                            )?;
                            b.trace_expect_result(child, tmp_ref, SUCCESS);
                            b.trace_match_content(child, tmp_ref)?;
                            let fin_ref = b.trace_path_ref(
                                child,
                                cwd_ref(),
                                Path::new("final"),
                                create_flags(),
                            )?;
                            b.trace_expect_result(child, fin_ref, SUCCESS);
                            std::fs::write(&fin, "F")?;
                            b.trace_update_content(child, fin_ref)?;
                            0
                        }
                    };
                    b.trace_exit(child, status)?;
                    b.trace_join(c, child, status);
                }
                Ok(0)
            }
        })
    };

    let report = invoke(&space.options(), run_children(&space))?;
    assert_eq!(space.read("final")?, b"F");
    assert!(report.stats.traced_commands >= 3);

    space.remove("final")?;
    let report = invoke(&space.options(), run_children(&space))?;
    let mut reasons: Vec<RerunReason> = report.planned.iter().map(|(_, r)| *r).collect();
    reasons.sort();
    assert_eq!(reasons, vec![RerunReason::OutputNeeded, RerunReason::Changed]);
    assert_eq!(space.read("final")?, b"F");
    assert_eq!(space.read("tmp")?, b"T");
    Ok(())
}

/// Scenario D: a command lists a directory and then adds an entry to it.
/// On the next run the listing differs from the pre-build state but matches
/// the post-build capture, so nothing re-runs.
#[test]
fn listing_plus_write_is_stable() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.mkdir("d")?;

    let x_path = space.path("d/x");
    invoke(
        &space.options(),
        script(move |b, c| {
            let d = b.trace_path_ref(c, cwd_ref(), Path::new("d"), read_flags())?;
            b.trace_expect_result(c, d, SUCCESS);
            b.trace_match_content(c, d)?;
            let x = b.trace_path_ref(c, cwd_ref(), Path::new("d/x"), create_flags())?;
            b.trace_expect_result(c, x, SUCCESS);
            std::fs::write(&x_path, "X")?;
            b.trace_update_content(c, x)?;
            Ok(0)
        }),
    )?;
    assert_eq!(space.read("d/x")?, b"X");

    let report = invoke(&space.options(), no_reruns())?;
    assert!(report.planned.is_empty(), "planned: {:?}", report.planned);
    Ok(())
}

/// Scenario E: a command reads through a symlink; the user re-points the
/// link between runs; the command re-runs.
#[test]
fn repointed_symlink_reruns_the_reader() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("target", "LT")?;
    std::os::unix::fs::symlink("target", space.path("link"))?;

    invoke(
        &space.options(),
        script(|b, c| {
            let r = b.trace_path_ref(c, cwd_ref(), Path::new("link"), read_flags())?;
            b.trace_expect_result(c, r, SUCCESS);
            b.trace_match_content(c, r)?;
            Ok(0)
        }),
    )?;

    std::fs::remove_file(space.path("link"))?;
    std::os::unix::fs::symlink("other", space.path("link"))?;

    let report = invoke(
        &space.options(),
        script(|b, c| {
            let r = b.trace_path_ref(c, cwd_ref(), Path::new("link"), read_flags())?;
            b.trace_expect_result(c, r, libc::ENOENT);
            Ok(0)
        }),
    )?;
    assert!(report
        .planned
        .iter()
        .any(|(_, reason)| *reason == RerunReason::Changed));
    Ok(())
}

/// Scenario F: a parent launches a child; the user deletes the child's
/// executable; the parent's reference predicate fails and it is Changed.
#[test]
fn deleted_child_executable_reruns_the_parent() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("b.sh", "writes out\n")?;

    let out_path = space.path("out");
    invoke(
        &space.options(),
        script(move |b, c| {
            let exe = b.trace_path_ref(c, cwd_ref(), Path::new("b.sh"), read_flags())?;
            b.trace_expect_result(c, exe, SUCCESS);
            let child = b.trace_launch(
                c,
                Path::new("b.sh"),
                vec!["b.sh".to_string()],
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

    space.remove("b.sh")?;
    let report = invoke(
        &space.options(),
        script(|b, c| {
            let exe = b.trace_path_ref(c, cwd_ref(), Path::new("b.sh"), read_flags())?;
            b.trace_expect_result(c, exe, libc::ENOENT);
            Ok(2)
        }),
    )?;
    let root = report
        .planned
        .iter()
        .find(|(_, reason)| *reason == RerunReason::Changed);
    assert!(root.is_some(), "planned: {:?}", report.planned);
    assert_eq!(report.root_status, Some(2));
    Ok(())
}

/// A command that creates and then removes a scratch file: the add/remove
/// pair cancels out, the next run plans nothing, and the scratch file is not
/// resurrected by the commit path.
#[test]
fn add_remove_pair_cancels() -> anyhow::Result<()> {
    let space = TestSpace::new()?;

    let scratch = space.path("scratch");
    invoke(
        &space.options(),
        script(move |b, c| {
            let dir = b.trace_path_ref(c, cwd_ref(), Path::new("."), read_flags())?;
            b.trace_expect_result(c, dir, SUCCESS);
            let r = b.trace_path_ref(c, cwd_ref(), Path::new("scratch"), create_flags())?;
            b.trace_expect_result(c, r, SUCCESS);
            std::fs::write(&scratch, "S")?;
            b.trace_update_content(c, r)?;
            std::fs::remove_file(&scratch)?;
            b.trace_remove_entry(c, dir, "scratch", r)?;
            Ok(0)
        }),
    )?;
    assert!(space.read("scratch").is_err());

    let report = invoke(&space.options(), no_reruns())?;
    assert!(report.planned.is_empty(), "planned: {:?}", report.planned);
    assert!(space.read("scratch").is_err());
    Ok(())
}

/// Dry runs report what would run without executing or touching the trace.
#[test]
fn dry_run_reports_without_executing() -> anyhow::Result<()> {
    let space = TestSpace::new()?;

    let out_path = space.path("out");
    invoke(
        &space.options(),
        script(move |b, c| {
            let r = b.trace_path_ref(c, cwd_ref(), Path::new("out"), create_flags())?;
            b.trace_expect_result(c, r, SUCCESS);
            std::fs::write(&out_path, "hi")?;
            b.trace_update_content(c, r)?;
            Ok(0)
        }),
    )?;
    let trace_before = space.trace_bytes()?;

    space.write("out", "edited")?;
    let mut options = space.options();
    options.dry_run = true;
    let report = invoke(&options, no_reruns())?;
    assert_eq!(report.planned.len(), 1);
    // Nothing ran, nothing was rewritten.
    assert_eq!(space.read("out")?, b"edited");
    assert_eq!(space.trace_bytes()?, trace_before);
    Ok(())
}
