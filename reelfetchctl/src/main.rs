use clap::Parser;

fn main() {
    let cli = reelfetchctl::Cli::parse();
    let code = reelfetchctl::run(cli);
    std::process::exit(code);
}
