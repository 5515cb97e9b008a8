//! Man page generator for espforge
//!
//! Usage: cargo run --bin gen-manpage -- [output-dir]

use clap::CommandFactory;
use std::fs;
use std::path::PathBuf;

#[path = "../cli.rs"]
#[allow(dead_code)]
mod cli;

fn main() -> std::io::Result<()> {
    let output_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("man"));

    fs::create_dir_all(&output_dir)?;

    let cmd = cli::Cli::command();
    let mut pages = vec![(String::from("espforge"), cmd.clone())];
    for sub in cmd.get_subcommands() {
        pages.push((format!("espforge-{}", sub.get_name()), sub.clone()));
    }

    for (name, page) in pages {
        let mut buffer = Vec::new();
        clap_mangen::Man::new(page)
            .title(name.as_str())
            .render(&mut buffer)?;
        let output_path = output_dir.join(format!("{}.1", name));
        fs::write(&output_path, buffer)?;
        println!("Man page generated at: {}", output_path.display());
    }

    println!("\nTo view the man page:");
    println!("  man -l {}", output_dir.join("espforge.1").display());

    Ok(())
}
