use clap::Parser;
use digit_mlp::{
    cli::{self, Cli},
    logging::install_logger,
};

fn main() {
    let cli = Cli::parse();
    install_logger(cli.verbose, cli.log_file.as_deref());

    if let Err(err) = cli::run(cli) {
        log::error!("{err}");
        std::process::exit(1);
    }
}
