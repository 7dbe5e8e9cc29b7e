use sharc::*;

use std::path::PathBuf;

use clap::Parser;

/// Shape analysis for heap-manipulating programs
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Run a built-in demo scenario against the analyzer core
    Demo {
        /// Which scenario to run
        #[clap(arg_enum)]
        scenario: DemoScenario,
        /// Directory to write per-heap Graphviz plots into
        #[clap(long)]
        plot_dir: Option<PathBuf>,
        /// Disable terminal logging, even for high severity alerts. Strongly
        /// discouraged for normal use.
        #[clap(long)]
        debug_disable_terminal_logging: bool,
        /// Force blocking for terminal logging. If too many messages are being
        /// spewed the logger, by default, does not block, but instead dumps a
        /// dropped-messages alert. This option forces it to block and dump
        /// even if too many are being sent.
        #[clap(long)]
        debug_forced_blocking_terminal_logging: bool,
        /// Path to send log (as JSON) to
        ///
        /// Error or higher severity alerts will still continue being shown at
        /// stderr (in addition to being added to the log)
        #[clap(long)]
        log_file: Option<PathBuf>,
        /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
        #[clap(short, long, parse(from_occurrences))]
        debug: usize,
        /// Advanced configuration options to tweak the analysis behavior
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<config::CommandLineAnalysisConfig>,
    },
}

#[derive(clap::ArgEnum, Clone, Copy, Debug)]
enum DemoScenario {
    /// Build a singly-linked list to a fixed point, then free it node by node
    SllBuildFree,
    /// Build a singly-linked list forever, never freeing (leaks at exit)
    SllBuildForever,
    /// Build a doubly-linked list to a fixed point
    DllBuild,
}

fn plot_states(
    smap_states: &state::SymHeapUnion,
    name: &str,
    pe: &mut plot::PlotEnumerator,
    dir: &Option<PathBuf>,
) {
    if let Some(dir) = dir {
        for sh in smap_states.iter() {
            if let Err(err) = plot::plot_heap(sh, name, pe, dir) {
                log::error!("failed to write a plot"; "err" => %err);
            }
        }
    }
}

fn run_demo(
    scenario: DemoScenario,
    plot_dir: Option<PathBuf>,
) -> Result<report::Reporter, heap::EngineError> {
    let mut reporter = report::Reporter::new();
    let mut pe = plot::PlotEnumerator::new();

    let p = match scenario {
        DemoScenario::DllBuild => scenarios::dll_program(),
        _ => scenarios::sll_program(),
    };
    let smap = scenarios::build_fixed_point(&p)?;
    let gs = fixpoint::compute_state_of(&p.stor, p.fnc, &smap);
    println!(
        "fixed point assembled: {} location(s), {} trace edge(s)",
        gs.locs.len(),
        gs.edges.len()
    );
    for (loc_idx, loc) in gs.locs.iter().enumerate() {
        let shapes: usize = loc.shape_lists.iter().map(|l| l.len()).sum();
        println!(
            "  loc #{}: insn #{}, {} heap(s), {} shape(s)",
            loc_idx,
            loc.insn,
            loc.heap_list.len(),
            shapes
        );
    }

    if config::CONFIG.plot_everything {
        for (loc_idx, loc) in gs.locs.iter().enumerate() {
            let name = format!("loc{}", loc_idx);
            plot_states(&loc.heap_list, &name, &mut pe, &plot_dir);
        }
    }

    let exit_states = smap.get(p.exit_insn).cloned().unwrap_or_default();
    plot_states(&exit_states, "exit", &mut pe, &plot_dir);

    let exit_loc = p.stor.instructions[p.exit_insn].loc;
    match scenario {
        DemoScenario::SllBuildFree => {
            for sh in exit_states.iter() {
                let done = scenarios::free_all(&p, sh.clone())?;
                plot_states(&done, "after-free", &mut pe, &plot_dir);
                for final_sh in done.iter() {
                    for junk in final_sh.collect_junk() {
                        reporter.report(
                            report::DefectKind::Leak,
                            exit_loc,
                            format!("object #{} never freed", junk.0),
                        );
                    }
                }
            }
        }
        DemoScenario::SllBuildForever | DemoScenario::DllBuild => {
            // the program exits with the list still allocated
            for sh in exit_states.iter() {
                let mut scoped = sh.clone();
                let lobj = scoped.obj_by_var(p.list_var);
                scoped.destroy(lobj)?;
                if let Some(tail_var) = p.tail_var {
                    let tobj = scoped.obj_by_var(tail_var);
                    scoped.destroy(tobj)?;
                }
                for junk in scoped.collect_junk() {
                    reporter.report(
                        report::DefectKind::Leak,
                        exit_loc,
                        format!("object #{} still reachable only from a dead scope", junk.0),
                    );
                }
            }
        }
    }

    Ok(reporter)
}

fn main() {
    let args = Args::parse();

    match args {
        Args::Demo {
            scenario,
            plot_dir,
            debug_disable_terminal_logging,
            debug_forced_blocking_terminal_logging,
            log_file,
            debug,
            advanced_config,
        } => {
            let _log_guard = slog_scope::set_global_logger(log::FileAndTermDrain::new(
                debug,
                debug_disable_terminal_logging,
                debug_forced_blocking_terminal_logging,
                log_file,
            ));

            config::AnalysisConfig::initialize(advanced_config);

            match run_demo(scenario, plot_dir) {
                Ok(reporter) => {
                    if reporter.defects().is_empty() {
                        println!("no defects found");
                    }
                    for d in reporter.defects() {
                        println!("{}: {:?}: {}", d.loc, d.kind, d.msg);
                    }
                    if reporter.unreliable() {
                        std::process::exit(2);
                    }
                }
                Err(err) => {
                    log::crit!("analysis failed with an internal error"; "err" => ?err);
                    std::process::exit(2);
                }
            }

            log::trace!("Done");
        }
    }
}
