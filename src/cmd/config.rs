//! Configuration view and validation commands: `modelsmith config`.

use anyhow::Result;
use modelsmith::config::AppConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config: &AppConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!("# Effective modelsmith configuration");
            println!(
                "# llm.api_key is {}",
                if config.llm.api_key.is_some() {
                    "set"
                } else {
                    "not set"
                }
            );
            println!();
            print!("{}", config.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
        }
    }
    Ok(())
}
