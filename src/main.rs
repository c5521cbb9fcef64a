use steens::*;

use std::path::PathBuf;

use clap::Parser;

/// Whole-program pointer analysis for SSA modules
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Run the unification-based analysis over a textual module
    Analyze {
        /// Path to the module file
        module: PathBuf,
        /// Path to write the call-target report to (defaults to stdout)
        #[clap(long)]
        output_report: Option<PathBuf>,
        /// Output the result graph as a GraphViz `.dot` file to the given path
        #[clap(long)]
        output_graphviz: Option<PathBuf>,
        /// Assert that two scalars landed in the same class, written as
        /// `funcA:x,funcB:y`; exits non-zero when the assertion fails
        #[clap(long = "check-same-node")]
        check_same_node: Vec<String>,
        /// Disable terminal logging, even for high severity alerts. Strongly discouraged for
        /// normal use.
        #[clap(long)]
        debug_disable_terminal_logging: bool,
        /// Force blocking for terminal logging. If too many messages are being spewed the logger,
        /// by default, does not block, but instead dumps a dropped-messages alert. This option
        /// forces it to block and dump even if too many are being sent.
        #[clap(long)]
        debug_forced_blocking_terminal_logging: bool,
        /// Path to send log (as JSON) to
        ///
        /// Error or higher severity alerts will still continue being shown at stderr (in addition
        /// to being added to the log)
        #[clap(long = "log")]
        log_file: Option<PathBuf>,
        /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
        #[clap(short, long, parse(from_occurrences))]
        debug: usize,
        /// Advanced configuration options to tweak the driver behavior
        #[clap(short = 'Z', long, arg_enum)]
        advanced: Vec<steensgaard::DriverOption>,
    },
}

fn main() {
    let args = Args::parse();

    match args {
        Args::Analyze {
            module,
            output_report,
            output_graphviz,
            check_same_node,
            debug_disable_terminal_logging,
            debug_forced_blocking_terminal_logging,
            log_file,
            debug,
            advanced,
        } => {
            let _log_guard = slog_scope::set_global_logger(log::FileAndTermDrain::new(
                debug,
                debug_disable_terminal_logging,
                debug_forced_blocking_terminal_logging,
                log_file,
            ));

            let text = std::fs::read_to_string(&module).expect("Module file could not be read");
            let module = match ir_loader::load_module(&text) {
                Ok(m) => m,
                Err(e) => {
                    eprintln!("error: {}", e);
                    std::process::exit(1);
                }
            };

            let mode: steensgaard::DriverMode = advanced.into();
            let mut local = local::LocalGraphBuilder::build(&module);
            let analysis = steensgaard::SteensgaardAnalysis::run(&module, &mut local, mode);
            let finder = call_targets::CallTargetFinder::find(&module, &analysis);

            let mut failed = false;
            for check in &check_same_node {
                match parse_check(&module, check) {
                    Ok((a, b)) => {
                        if analysis.same_node(a, b) {
                            println!("ok: {}", check);
                        } else {
                            eprintln!("FAILED: {}", check);
                            failed = true;
                        }
                    }
                    Err(e) => {
                        eprintln!("error: bad --check-same-node {}: {}", check, e);
                        failed = true;
                    }
                }
            }

            if let Some(path) = output_graphviz {
                use std::io::Write;
                write!(
                    std::fs::File::create(path).unwrap(),
                    "{}",
                    dot_export::generate_dot(analysis.result_graph(), &module)
                )
                .unwrap();
            }

            match output_report {
                Some(path) => {
                    let mut f = std::fs::File::create(path).unwrap();
                    finder.write_report(&module, &mut f).unwrap();
                }
                None => {
                    let stdout = std::io::stdout();
                    finder.write_report(&module, &mut stdout.lock()).unwrap();
                }
            }

            let counters = finder.counters();
            log::info!(
                "Call-target summary";
                "direct" => counters.direct,
                "indirect" => counters.indirect,
                "complete_indirect" => counters.complete_indirect,
                "complete_empty" => counters.complete_empty,
            );

            if failed {
                std::process::exit(1);
            }
        }
    }
}

/// `funcA:x,funcB:y` names two locals that must share a class.
fn parse_check(module: &ir::Module, check: &str) -> Result<(ir::Value, ir::Value), String> {
    let (a, b) = check
        .split_once(',')
        .ok_or_else(|| "expected two comma-separated scalars".to_owned())?;
    let parse_one = |s: &str| -> Result<ir::Value, String> {
        let (f, l) = s
            .split_once(':')
            .ok_or_else(|| format!("expected func:local, got {}", s))?;
        module
            .local_value(f.trim(), l.trim())
            .ok_or_else(|| format!("no local %{} in @{}", l.trim(), f.trim()))
    };
    Ok((parse_one(a)?, parse_one(b)?))
}
