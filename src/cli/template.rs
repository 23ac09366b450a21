//! Template CLI subcommands.

use std::path::PathBuf;

use anyhow::Result;
use clap::Subcommand;

use crate::domain::IntentTemplate;

/// Template-related subcommands
#[derive(Subcommand, Debug)]
pub enum TemplateCommands {
    /// Register a template from a YAML file
    Register {
        /// Path to the template YAML
        file: PathBuf,
    },

    /// Show a registered template as YAML
    Show {
        /// Template name
        name: String,

        /// Version (latest if omitted)
        #[arg(long)]
        version: Option<u32>,
    },

    /// List registered templates
    List,
}

/// Execute template subcommands
pub async fn execute(command: TemplateCommands) -> Result<()> {
    let ctx = super::open_context()?;

    match command {
        TemplateCommands::Register { file } => {
            let template = IntentTemplate::from_file(&file)?;
            let registered = ctx.templates.register(template)?;
            println!(
                "Registered {} v{} ({} steps)",
                registered.name,
                registered.version,
                registered.steps.len()
            );
            Ok(())
        }
        TemplateCommands::Show { name, version } => {
            let template = ctx.templates.get(&name, version)?;
            print!("{}", serde_yaml::to_string(template.as_ref())?);
            Ok(())
        }
        TemplateCommands::List => {
            let templates = ctx.templates.list()?;
            if templates.is_empty() {
                println!("No templates registered");
                return Ok(());
            }

            println!("{:<28} {:<8} {:<6} {:<24} {}", "NAME", "VERSION", "STEPS", "SCOPE", "TIMEOUT");
            println!("{}", "-".repeat(80));
            for template in templates {
                println!(
                    "{:<28} {:<8} {:<6} {:<24} {}s",
                    template.name,
                    template.version,
                    template.steps.len(),
                    template.policy_scope,
                    template.timeout().as_secs()
                );
            }
            Ok(())
        }
    }
}
