use nox::cli::{self, Cli};
use nox::logging::Logging;

fn main() {
    if let Err(err) = Logging::try_init() {
        eprintln!("Error: {err}");
        std::process::exit(cli::EXIT_FAILURE);
    }

    let exit_code = cli::run(Cli::init_cli());
    std::process::exit(exit_code);
}
