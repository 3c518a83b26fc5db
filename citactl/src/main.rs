use clap::Parser;

fn main() {
    let cli = citactl::Cli::parse();
    match citactl::run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}
