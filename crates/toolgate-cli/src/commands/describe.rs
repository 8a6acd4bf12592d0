//! `toolgate describe` command implementation.

use std::path::Path;

use anyhow::{Result, bail};
use clap::Args;
use console::style;
use toolgate_core::{ParamSchema, Tool};

#[derive(Debug, Args)]
pub struct DescribeArgs {
    /// Tool name; near misses are answered with suggestions.
    pub tool: String,

    /// Output format: "text" or "json"
    #[arg(short, long, default_value = "text")]
    pub format: String,
}

pub fn run(args: &DescribeArgs, config: Option<&Path>) -> Result<()> {
    let executor = super::gateway(config)?;

    let tool = match executor.registry().resolve(&args.tool) {
        Ok(tool) => tool,
        Err(not_found) => {
            let error = not_found.to_structured();
            match &error.hint {
                Some(hint) => bail!("{} ({hint})", error.message),
                None => bail!("{}", error.message),
            }
        }
    };

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&tool.descriptor())?);
    } else {
        print!("{}", render(&tool));
    }
    Ok(())
}

fn render(tool: &Tool) -> String {
    let mut out = format!(
        "{}\n  {}\n  write action: {}\n",
        style(tool.name()).bold(),
        tool.description(),
        tool.classification().label()
    );
    out.push_str(&render_params(tool.params()));
    out
}

fn render_params(params: &ParamSchema) -> String {
    if params.params().is_empty() {
        return "  parameters: none\n".to_string();
    }

    let mut out = String::from("  parameters:\n");
    for param in params.params() {
        let marker = if param.required { "required" } else { "optional" };
        out.push_str(&format!("    {} ({:?}, {marker})", param.name, param.kind));
        if let Some(description) = &param.description {
            out.push_str(&format!(": {description}"));
        }
        out.push('\n');
    }
    if params.accepts_extra() {
        out.push_str("    (additional arguments accepted)\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use toolgate_core::{ParamKind, ParamSpec};

    use super::*;

    #[test]
    fn test_render_params_lists_each_parameter() {
        let schema = ParamSchema::new(vec![
            ParamSpec::required("url", ParamKind::String).with_description("Target"),
            ParamSpec::optional("method", ParamKind::String),
        ]);

        let rendered = render_params(&schema);
        assert!(rendered.contains("url (String, required): Target"));
        assert!(rendered.contains("method (String, optional)\n"));
        assert!(!rendered.contains("additional"));
    }

    #[test]
    fn test_render_params_empty_schema() {
        assert_eq!(render_params(&ParamSchema::default()), "  parameters: none\n");
    }
}
