use recon::*;

use std::path::PathBuf;

use clap::Parser;

/// Reconstruct C-like source trees from decoded binaries
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Load a PIR document, report on its functions, and optionally re-emit it
    CheckPir {
        /// Path to a PIR document
        pir_file: PathBuf,
        /// Path to re-encode the document to after loading
        #[clap(long)]
        output_pir: Option<PathBuf>,
        /// Path to output a C-like listing of every function's high-level tree
        #[clap(long)]
        output_listing: Option<PathBuf>,
        /// Disable terminal logging, even for high severity alerts. Strongly discouraged for normal
        /// use.
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
        #[clap(long = "--log")]
        log_file: Option<PathBuf>,
        /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
        #[clap(short, long, parse(from_occurrences))]
        debug: usize,
        /// Advanced configuration options to tweak the reduction behavior
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<reduction_config::CommandLineReductionConfig>,
    },
}

fn main() {
    let args = Args::parse();

    match args {
        Args::CheckPir {
            pir_file,
            output_pir,
            output_listing,
            debug_disable_terminal_logging,
            debug_forced_blocking_terminal_logging,
            log_file,
            debug,
            advanced_config,
        } => {
            let _log_guard = slog_scope::set_global_logger(crate::log::FileAndTermDrain::new(
                debug,
                debug_disable_terminal_logging,
                debug_forced_blocking_terminal_logging,
                log_file,
            ));

            reduction_config::ReductionConfig::initialize(advanced_config);

            let input =
                std::fs::read_to_string(pir_file).expect("PIR document could not be read");
            let doc = match pir::Document::decode(&input) {
                Ok(doc) => doc,
                Err(e) => {
                    log::crit!("Could not decode PIR document"; "error" => e);
                    std::process::exit(1);
                }
            };

            for func in &doc.functions {
                log::info!(
                    "Loaded function";
                    "name" => &func.name,
                    "address" => format!("{:#x}", func.address),
                    "trees" => func.roots.len(),
                    "spans" => func.spans.len(),
                );
            }

            if reduction_config::CONFIG.verify_round_trip_on_decode {
                let reencoded = doc.encode();
                if reencoded != input {
                    log::warn!("Re-encoding the document did not reproduce the input exactly");
                }
            }

            let listing = doc
                .functions
                .iter()
                .map(|func| {
                    format!(
                        "// {} @ {:#x}\n{}",
                        func.name,
                        func.address,
                        ast::render_stmt(&doc.context.pool, func.high_root())
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            if let Some(path) = output_listing {
                use std::io::Write;
                write!(std::fs::File::create(path).unwrap(), "{}", listing).unwrap();
            } else {
                println!("{}", listing);
            }

            if let Some(path) = output_pir {
                use std::io::Write;
                write!(std::fs::File::create(path).unwrap(), "{}", doc.encode()).unwrap();
            }

            log::trace!("Done");
        }
    }
}
