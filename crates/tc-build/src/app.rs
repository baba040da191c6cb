use crate::cli::{Cli, Commands, SourcesCmd};
use crate::utils;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Instant;

pub fn run(cli: Cli) -> Result<()> {
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("Failed to get the current directory")?,
    };
    let root = absolute(root)?;
    log::debug!("root folder: {}", root.display());

    let start = Instant::now();
    match &cli.command {
        Commands::Binutils(args) => crate::binutils::run(args, &root)?,
        Commands::Llvm(args) => crate::llvm::pipeline::run(args, &root)?,
        Commands::Rust(args) => crate::rust::run(args, &root)?,
        Commands::Kernel(args) => crate::kernel::run(args, &root)?,
        Commands::Sources { cmd } => {
            return match cmd {
                SourcesCmd::Status => crate::vendor::status(&root),
                SourcesCmd::Clean { name } => crate::vendor::clean(&root, name.as_deref()),
            };
        }
    }

    println!("Script duration: {}", utils::get_duration(start));
    Ok(())
}

/// Relative roots are taken from the current directory so that builds
/// running in other folders still agree on the layout.
fn absolute(root: PathBuf) -> Result<PathBuf> {
    if root.is_absolute() {
        return Ok(root);
    }
    Ok(std::env::current_dir()
        .context("Failed to get the current directory")?
        .join(root))
}
