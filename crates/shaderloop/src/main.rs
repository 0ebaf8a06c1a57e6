mod cli;
mod paths;
mod run;
mod session;
mod watch;

use anyhow::Result;
use cli::Command;

fn main() -> Result<()> {
    let cli = cli::parse();
    run::initialise_tracing();

    match cli.command {
        Some(Command::Check(args)) => run::check(args),
        Some(Command::Where) => run::print_paths(),
        None => run::run(cli.run),
    }
}
