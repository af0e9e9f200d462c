use clap::Parser;

fn main() {
    let cli = aifabrix::cli::Cli::parse();
    aifabrix::logging::init(cli.verbose);
    if let Err(err) = aifabrix::app::run(cli) {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
