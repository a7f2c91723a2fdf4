//! Entry point for the romog CLI.

use anyhow::Result;
use clap::Parser;
use romorganizer::{
    cache::Counts,
    cli::{Cli, Commands},
    config::Config,
    logging, rebuilder, scanner,
};
use std::io::{self, BufRead, Write};

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose, cli.quiet);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let counts = match cli.command {
        Commands::Scan { dat, folder, yes } => {
            scanner::scan(&config, &dat, &folder, || yes || confirm_refresh())?
        }
        Commands::Rebuild {
            dat,
            folder,
            remove_staging,
        } => rebuilder::rebuild(&config, &dat, &folder, remove_staging)?,
    };

    println!();
    print_counts(&counts);
    Ok(())
}

/// The one interactive prompt: the catalog filename changed since the
/// cache was built.
fn confirm_refresh() -> bool {
    print!("The DAT file has changed. Update the cache against it? [y/N] ");
    let _ = io::stdout().flush();
    let mut input = String::new();
    if io::stdin().lock().read_line(&mut input).is_err() {
        return false;
    }
    input.trim().eq_ignore_ascii_case("y")
}

fn print_counts(counts: &Counts) {
    println!("Sets have:    {}/{}", counts.sets_have, counts.sets_total);
    println!(
        "Sets missing: {}/{}",
        counts.sets_total - counts.sets_have,
        counts.sets_total
    );
    println!("Roms have:    {}/{}", counts.roms_have, counts.roms_total);
    println!(
        "Roms missing: {}/{}",
        counts.roms_total - counts.roms_have,
        counts.roms_total
    );
}
