use clap::Parser;

/// Command-line options for the garbage-collection tool.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the sqlite database file. Defaults to the same location
    /// `Database::new_default` would pick.
    #[arg(long)]
    pub db_path: Option<String>,

    /// Report what would be deleted without deleting it.
    #[arg(long)]
    pub dry_run: bool,
}
