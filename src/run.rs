//! The command line entry point and the per-invocation pipeline.
//!
//! One invocation is: load the previous trace (or synthesize the default
//! startup trace), evaluate it against a fresh model to find what changed,
//! plan, execute the plan against a second fresh model, annotate post-build
//! predicates, and write the new trace back.

use std::path::PathBuf;

use anyhow::anyhow;
use tracing::debug;

use crate::build::{Build, BuildOptions, BuildStats, CommandRunner};
use crate::command::{CommandId, Commands};
use crate::db::Db;
use crate::env::Env;
use crate::ir;
use crate::observer::LogObserver;
use crate::perf;
use crate::plan::{self, RebuildPlan, RerunReason};

pub struct InvokeOptions {
    pub db_dir: PathBuf,
    pub root: PathBuf,
    pub cwd: PathBuf,
    pub buildfile: PathBuf,
    pub dry_run: bool,
    pub commit: bool,
    pub print_on_run: bool,
}

pub struct InvokeReport {
    /// Commands the planner marked, with their strongest reason.
    pub planned: Vec<(CommandId, RerunReason)>,
    pub stats: BuildStats,
    /// Exit status of the root build command, when it has one.
    pub root_status: Option<i32>,
}

/// Run one complete build invocation. The runner executes must-rerun
/// commands; None uses real processes.
pub fn invoke(
    options: &InvokeOptions,
    runner: Option<Box<dyn CommandRunner>>,
) -> anyhow::Result<InvokeReport> {
    let db = Db::open(&options.db_dir)?;
    let (mut commands, input) = match perf::scope("db::load", || db.load_trace())? {
        Some(loaded) => loaded,
        None => {
            let mut commands = Commands::new();
            let trace = ir::default_trace(&mut commands, &options.buildfile);
            (commands, trace)
        }
    };

    // Evaluation pass: emulate everything, collecting predicate outcomes.
    let mut env = Env::new(db.dir(), &options.root, &options.cwd)?;
    {
        let plan = RebuildPlan::emulate_all(&commands);
        let mut build = Build::new(
            &mut env,
            &mut commands,
            plan,
            BuildOptions {
                commit: false,
                print_on_run: false,
            },
        );
        build.add_observer(Box::new(LogObserver));
        perf::scope("evaluate", || -> anyhow::Result<()> {
            build.run(&input)?;
            build.finish()
        })?;
    }

    let plan = perf::scope("plan", || {
        plan::plan_build(&mut commands, &env, options.dry_run)
    });
    let planned: Vec<(CommandId, RerunReason)> = commands
        .ids()
        .filter_map(|id| commands.get(id).rerun_reason.map(|r| (id, r)))
        .collect();
    debug!(target: "rebuild", "{} of {} commands must rerun", planned.len(), commands.len());

    if options.dry_run {
        for (id, _) in &planned {
            println!("{}", commands.get(*id).short_name(80));
        }
    }

    // Execution pass against a fresh model. On a dry run the marked commands
    // have the Skip disposition: their stale steps are carried through
    // unchanged and nothing is written back.
    commands.reset_run_state();
    let mut env = Env::new(db.dir(), &options.root, &options.cwd)?;
    let mut build = Build::new(
        &mut env,
        &mut commands,
        plan,
        BuildOptions {
            commit: options.commit && !options.dry_run,
            print_on_run: options.print_on_run,
        },
    );
    build.add_observer(Box::new(LogObserver));
    if let Some(runner) = runner {
        build.set_runner(runner);
    }
    perf::scope("execute", || -> anyhow::Result<()> {
        build.run(&input)?;
        build.finish()
    })?;
    if !options.dry_run {
        // Skip-copied steps keep their original post-build twins; only a
        // committing run re-derives them.
        build.annotate_post_build();
    }
    let stats = build.stats();
    let out = build.into_trace();

    if !options.dry_run {
        perf::scope("db::save", || db.save_trace(&commands, &out))?;
        if options.commit {
            env.cache().swap()?;
        }
    }

    let root_status = if commands.len() > 1 {
        commands.get(CommandId(1)).exit_status
    } else {
        None
    };
    Ok(InvokeReport {
        planned,
        stats,
        root_status,
    })
}

#[derive(argh::FromArgs)] // this struct generates the flags and --help output
/// retrace, a build tool that learns the build's structure by watching it run
struct Opts {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// input build file [default=Buildfile]
    #[argh(option, short = 'f', default = "(\"Buildfile\".into())")]
    build_file: String,

    /// database directory [default=.retrace]
    #[argh(option, default = "(\".retrace\".into())")]
    db: String,

    /// plan only, printing the commands that would run
    #[argh(switch, short = 'n')]
    dry_run: bool,

    /// leave the filesystem untouched at the end of the run
    #[argh(switch)]
    no_commit: bool,

    /// print executed command lines
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// debugging tools
    #[argh(option, short = 'd')]
    debug: Option<String>,
}

fn run_impl() -> anyhow::Result<i32> {
    let opts: Opts = argh::from_env();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if opts.verbose { "debug" } else { "warn" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Some(debug) = &opts.debug {
        match debug.as_str() {
            "list" => {
                println!("debug tools:");
                println!("  trace  generate json performance trace");
                return Ok(1);
            }
            "trace" => perf::open("retrace_perf.json")?,
            _ => anyhow::bail!("unknown -d {:?}, use -d list to list", debug),
        }
    }

    if let Some(dir) = &opts.chdir {
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }

    let cwd = std::env::current_dir()?;
    let options = InvokeOptions {
        db_dir: cwd.join(&opts.db),
        root: PathBuf::from("/"),
        cwd: cwd.clone(),
        buildfile: PathBuf::from(&opts.build_file),
        dry_run: opts.dry_run,
        commit: !opts.no_commit,
        print_on_run: opts.verbose,
    };

    let report = invoke(&options, None)?;
    if opts.dry_run {
        println!(
            "retrace: {} command{} would run",
            report.planned.len(),
            if report.planned.len() == 1 { "" } else { "s" }
        );
        return Ok(0);
    }

    match report.stats.traced_commands {
        0 => println!("retrace: no work to do"),
        n => println!(
            "retrace: ran {} command{}, now up to date",
            n,
            if n == 1 { "" } else { "s" }
        ),
    }

    if let Some(status) = report.root_status {
        if status != 0 {
            println!("retrace: build failed with status {}", status);
            return Ok(1);
        }
    }
    Ok(0)
}

pub fn run() -> anyhow::Result<i32> {
    let res = run_impl();
    perf::close()?;
    res
}
