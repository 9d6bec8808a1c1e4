use clap::Parser as _;
use tracing_subscriber::EnvFilter;

use cauce::cli::Cli;
use cauce::driver;
use cauce::producer::ProducerRegistry;
use cauce::shell_history::ShellHistoryProducer;

/// Initialize tracing subscriber for diagnostics on stderr.
fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Every producer the binary ships with, resolved once at startup.
fn default_registry() -> ProducerRegistry {
    let mut registry = ProducerRegistry::new();
    registry.register(Box::new(ShellHistoryProducer::new()));
    registry
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Help and version are not usage errors.
            let code = match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    init_tracing(cli.debug);
    let mut registry = default_registry();

    if cli.dump_rules {
        match driver::load_rules(&cli.rules_file, &registry) {
            Ok(rules) => {
                print!("{}", rules.dump());
                return;
            }
            Err(err) => {
                eprintln!("cauce: {err}");
                std::process::exit(err.exit_code());
            }
        }
    }

    if let Err(err) = driver::run(&cli.rules_file, &cli.rules, &mut registry) {
        eprintln!("cauce: {err}");
        std::process::exit(err.exit_code());
    }
}
