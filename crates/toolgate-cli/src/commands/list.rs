//! `toolgate list` command implementation.

use std::{borrow::Cow, path::Path};

use anyhow::Result;
use clap::Args;
use console::style;
use toolgate_core::ToolDescriptor;

const DESCRIPTION_COLUMNS: usize = 40;

/// First line of a description, fitted to `columns` terminal cells.
fn description_cell(description: &str, columns: usize) -> Cow<'_, str> {
    let first_line = description.lines().next().unwrap_or_default();
    console::truncate_str(first_line, columns, "...")
}

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Output format: "table" for humans or "json" for the raw catalog
    #[arg(short, long, default_value = "table")]
    pub format: String,
}

pub fn run(args: &ListArgs, config: Option<&Path>) -> Result<()> {
    let executor = super::gateway(config)?;
    let catalog = executor.catalog();

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&catalog)?);
    } else if catalog.is_empty() {
        println!("No tools found");
    } else {
        print_table(&catalog);
    }

    Ok(())
}

fn print_table(catalog: &[ToolDescriptor]) {
    println!(
        "{:<24} {:<10} {}",
        style("TOOL").bold(),
        style("ACTION").bold(),
        style("DESCRIPTION").bold()
    );
    println!("{}", "-".repeat(76));

    for tool in catalog {
        println!(
            "{:<24} {:<10} {}",
            tool.name,
            tool.write_action,
            description_cell(&tool.description, DESCRIPTION_COLUMNS)
        );
    }

    println!("\n{} {} tool(s) available", style("✓").green(), catalog.len());
}
